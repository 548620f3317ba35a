//! The shapes of event the analytics engine writes to its output streams, and
//! how each one maps onto a Postgres table.
//!
//! Column names in the payloads are upper-case (the analytics engine's SQL
//! identifiers), the lower-case spellings are accepted as well. Adding a stream
//! means adding a variant here and mapping its stream name in the config; the
//! consumer loop does not change.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use rust_decimal::Decimal;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::error::DecodeError;
use crate::sink::WriteMode;

pub const MAX_DEVICE_ID_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamVariant {
    AccelerationSample,
    WarningEvent,
}

/// A table column: name, DDL type and the array type its values are bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub array_type: &'static str,
}

const fn column(name: &'static str, sql_type: &'static str, array_type: &'static str) -> Column {
    Column {
        name,
        sql_type,
        array_type,
    }
}

const PEAK_ACCEL_COLUMNS: &[Column] = &[
    column("device_id", "VARCHAR(5) NOT NULL", "varchar"),
    column("peak_acceleration", "NUMERIC", "numeric"),
    column("sample_count", "INTEGER", "int4"),
    column("acceleration_time", "TIMESTAMP", "timestamp"),
    column("ingest_time", "TIMESTAMP", "timestamp"),
];

const WARNINGS_COLUMNS: &[Column] = &[
    column("device_id", "VARCHAR(5) NOT NULL", "varchar"),
    column("warning_acceleration", "NUMERIC", "numeric"),
    column("warning_time", "TIMESTAMP", "timestamp"),
    column("ingest_time", "TIMESTAMP", "timestamp"),
];

impl StreamVariant {
    pub fn name(&self) -> &'static str {
        match self {
            StreamVariant::AccelerationSample => "acceleration_sample",
            StreamVariant::WarningEvent => "warning_event",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            StreamVariant::AccelerationSample => "peak_accel",
            StreamVariant::WarningEvent => "warnings",
        }
    }

    /// Event time column; `(device_id, time_column)` is the upsert key.
    pub fn time_column(&self) -> &'static str {
        match self {
            StreamVariant::AccelerationSample => "acceleration_time",
            StreamVariant::WarningEvent => "warning_time",
        }
    }

    /// Columns in insert order, `id` excluded.
    pub fn columns(&self) -> &'static [Column] {
        match self {
            StreamVariant::AccelerationSample => PEAK_ACCEL_COLUMNS,
            StreamVariant::WarningEvent => WARNINGS_COLUMNS,
        }
    }

    /// Whether records of this stream go through the alert gate.
    pub fn raises_alerts(&self) -> bool {
        matches!(self, StreamVariant::WarningEvent)
    }

    pub fn decode(&self, payload: &[u8]) -> Result<SinkRow, DecodeError> {
        let json_error = |source| DecodeError::Json {
            variant: self.name(),
            source,
        };

        let row = match self {
            StreamVariant::AccelerationSample => {
                SinkRow::Acceleration(serde_json::from_slice(payload).map_err(json_error)?)
            }
            StreamVariant::WarningEvent => {
                SinkRow::Warning(serde_json::from_slice(payload).map_err(json_error)?)
            }
        };

        check_device_id(row.device_id())?;
        Ok(row)
    }

    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.table_name())
    }

    pub fn create_table_sql(&self, if_not_exists: bool) -> String {
        let columns = self
            .columns()
            .iter()
            .map(|c| format!("    {} {}", c.name, c.sql_type))
            .collect::<Vec<_>>()
            .join(",\n");

        format!(
            "CREATE TABLE {}{} (\n    id SERIAL PRIMARY KEY,\n{}\n)",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.table_name(),
            columns
        )
    }

    /// Statements that bring the table into shape for `mode`, in execution order.
    /// With `reset` the table is dropped and recreated, otherwise an existing
    /// table is kept.
    pub fn ddl(&self, mode: WriteMode, reset: bool) -> Vec<String> {
        let mut statements = Vec::with_capacity(3);
        if reset {
            statements.push(self.drop_table_sql());
        }
        statements.push(self.create_table_sql(!reset));

        if mode == WriteMode::Upsert {
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {table}_device_id_{time}_key ON {table} (device_id, {time})",
                table = self.table_name(),
                time = self.time_column(),
            ));
        }

        statements
    }

    /// Columnar insert: one array parameter per column, unnested server side.
    pub fn insert_sql(&self, mode: WriteMode) -> String {
        let columns = self.columns();
        let names = columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ");
        let arrays = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("${}::{}[]", i + 1, c.array_type))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({names}) SELECT * FROM UNNEST({arrays})",
            self.table_name()
        );

        if mode == WriteMode::Upsert {
            let updates = columns
                .iter()
                .filter(|c| c.name != "device_id" && c.name != self.time_column())
                .map(|c| format!("{0} = EXCLUDED.{0}", c.name))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(
                " ON CONFLICT (device_id, {}) DO UPDATE SET {updates}",
                self.time_column()
            ));
        }

        sql
    }
}

impl fmt::Display for StreamVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStreamVariantError(String);

impl fmt::Display for ParseStreamVariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is not a stream variant, use acceleration_sample or warning_event",
            self.0
        )
    }
}

impl FromStr for StreamVariant {
    type Err = ParseStreamVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "acceleration_sample" | "acceleration" => Ok(StreamVariant::AccelerationSample),
            "warning_event" | "warning" => Ok(StreamVariant::WarningEvent),
            _ => Err(ParseStreamVariantError(s.to_owned())),
        }
    }
}

/// Peak acceleration of one device over one analytics window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccelerationSample {
    #[serde(alias = "DEVICE_ID")]
    pub device_id: String,
    #[serde(alias = "PEAK_ACCELERATION", deserialize_with = "decimal")]
    pub peak_acceleration: Decimal,
    #[serde(alias = "COUNT_ACCEL", alias = "count_accel")]
    pub sample_count: i32,
    #[serde(
        alias = "ACCELERATION_TIME",
        alias = "acceleration_time",
        deserialize_with = "timestamp"
    )]
    pub window_end_time: NaiveDateTime,
}

/// A device whose acceleration stayed above the warning threshold.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WarningEvent {
    #[serde(alias = "DEVICE_ID")]
    pub device_id: String,
    #[serde(alias = "WARNING_ACCELERATION", deserialize_with = "decimal")]
    pub warning_acceleration: Decimal,
    #[serde(alias = "WARNING_TIME", deserialize_with = "timestamp")]
    pub warning_time: NaiveDateTime,
    /// Set when the device dropped back below the threshold.
    #[serde(default, alias = "RECOVERED")]
    pub recovered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkRow {
    Acceleration(AccelerationSample),
    Warning(WarningEvent),
}

impl SinkRow {
    pub fn variant(&self) -> StreamVariant {
        match self {
            SinkRow::Acceleration(_) => StreamVariant::AccelerationSample,
            SinkRow::Warning(_) => StreamVariant::WarningEvent,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            SinkRow::Acceleration(sample) => &sample.device_id,
            SinkRow::Warning(warning) => &warning.device_id,
        }
    }

    pub fn event_time(&self) -> NaiveDateTime {
        match self {
            SinkRow::Acceleration(sample) => sample.window_end_time,
            SinkRow::Warning(warning) => warning.warning_time,
        }
    }

    pub fn as_warning(&self) -> Option<&WarningEvent> {
        match self {
            SinkRow::Warning(warning) => Some(warning),
            SinkRow::Acceleration(_) => None,
        }
    }
}

fn check_device_id(device_id: &str) -> Result<(), DecodeError> {
    if device_id.trim().is_empty() {
        return Err(DecodeError::EmptyDeviceId);
    }
    if device_id.chars().count() > MAX_DEVICE_ID_LEN {
        return Err(DecodeError::DeviceIdTooLong(device_id.to_owned()));
    }
    Ok(())
}

/// `YYYY-MM-DD HH:MM:SS[.fff]` as the analytics engine writes it, or RFC 3339.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|time| time.naive_utc())
        })
}

fn timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_timestamp(&text).ok_or_else(|| D::Error::custom(format!("invalid timestamp {text:?}")))
}

// Numbers go through their shortest decimal rendering, so 0.1 stays exactly 0.1.
fn decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let text = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(number) => number.to_string(),
        serde_json::Value::String(text) => text.trim().to_owned(),
        other => return Err(D::Error::custom(format!("expected a number, got {other}"))),
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| D::Error::custom(format!("invalid decimal {text:?}: {e}")))
}
