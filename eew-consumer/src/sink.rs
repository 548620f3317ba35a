use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use eew_common::stream::LogRecord;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::error::SinkWriteError;
use crate::metrics_consts::{
    DECODE_ERRORS, DUPLICATES_IN_BATCH, ROWS_WRITTEN, SINK_WRITE_ERRORS, SINK_WRITE_TIME,
};
use crate::variant::{SinkRow, StreamVariant};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Plain insert; a redelivered record becomes a second row.
    Insert,
    /// Insert or update on `(device_id, <time column>)`.
    Upsert,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseWriteModeError(String);

impl fmt::Display for ParseWriteModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a write mode, use insert or upsert", self.0)
    }
}

impl FromStr for WriteMode {
    type Err = ParseWriteModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "insert" => Ok(WriteMode::Insert),
            "upsert" => Ok(WriteMode::Upsert),
            _ => Err(ParseWriteModeError(s.to_owned())),
        }
    }
}

/// Where decoded rows end up. All rows handed to one `insert_rows` call belong
/// to `variant`.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn prepare_table(
        &self,
        variant: StreamVariant,
        mode: WriteMode,
        reset: bool,
    ) -> Result<(), SinkWriteError>;

    /// One statement for all `rows`; returns the number of rows affected.
    async fn insert_rows(
        &self,
        variant: StreamVariant,
        mode: WriteMode,
        rows: &[SinkRow],
        ingest_time: NaiveDateTime,
    ) -> Result<u64, SinkWriteError>;
}

pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Default)]
struct AccelerationColumns {
    device_ids: Vec<String>,
    peak_accelerations: Vec<Decimal>,
    sample_counts: Vec<i32>,
    acceleration_times: Vec<NaiveDateTime>,
}

#[derive(Default)]
struct WarningColumns {
    device_ids: Vec<String>,
    warning_accelerations: Vec<Decimal>,
    warning_times: Vec<NaiveDateTime>,
}

#[async_trait]
impl RowSink for PgSink {
    async fn prepare_table(
        &self,
        variant: StreamVariant,
        mode: WriteMode,
        reset: bool,
    ) -> Result<(), SinkWriteError> {
        for statement in variant.ddl(mode, reset) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        info!(table = variant.table_name(), reset, "sink table ready");
        Ok(())
    }

    async fn insert_rows(
        &self,
        variant: StreamVariant,
        mode: WriteMode,
        rows: &[SinkRow],
        ingest_time: NaiveDateTime,
    ) -> Result<u64, SinkWriteError> {
        let sql = variant.insert_sql(mode);

        let result = match variant {
            StreamVariant::AccelerationSample => {
                let mut columns = AccelerationColumns::default();
                for row in rows {
                    if let SinkRow::Acceleration(sample) = row {
                        columns.device_ids.push(sample.device_id.clone());
                        columns.peak_accelerations.push(sample.peak_acceleration);
                        columns.sample_counts.push(sample.sample_count);
                        columns.acceleration_times.push(sample.window_end_time);
                    }
                }
                let ingest_times = vec![ingest_time; columns.device_ids.len()];

                sqlx::query(&sql)
                    .bind(&columns.device_ids)
                    .bind(&columns.peak_accelerations)
                    .bind(&columns.sample_counts)
                    .bind(&columns.acceleration_times)
                    .bind(&ingest_times)
                    .execute(&self.pool)
                    .await?
            }
            StreamVariant::WarningEvent => {
                let mut columns = WarningColumns::default();
                for row in rows {
                    if let SinkRow::Warning(warning) = row {
                        columns.device_ids.push(warning.device_id.clone());
                        columns.warning_accelerations.push(warning.warning_acceleration);
                        columns.warning_times.push(warning.warning_time);
                    }
                }
                let ingest_times = vec![ingest_time; columns.device_ids.len()];

                sqlx::query(&sql)
                    .bind(&columns.device_ids)
                    .bind(&columns.warning_accelerations)
                    .bind(&columns.warning_times)
                    .bind(&ingest_times)
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(result.rows_affected())
    }
}

/// A row as stored by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub row: SinkRow,
    pub ingest_time: NaiveDateTime,
}

/// Sink that keeps rows in memory and applies insert/upsert semantics the way
/// the Postgres tables do. Clones share state.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkInner>>,
}

#[derive(Default)]
struct MemorySinkInner {
    tables: HashMap<&'static str, Vec<StoredRow>>,
    insert_calls: Vec<usize>,
    failures: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` inserts are rejected.
    pub fn fail_next_inserts(&self, count: usize) {
        self.lock().failures += count;
    }

    pub fn rows(&self, variant: StreamVariant) -> Vec<StoredRow> {
        self.lock()
            .tables
            .get(variant.table_name())
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, variant: StreamVariant) -> usize {
        self.lock()
            .tables
            .get(variant.table_name())
            .map_or(0, Vec::len)
    }

    /// Number of rows passed to each `insert_rows` call, failed calls included.
    pub fn insert_calls(&self) -> Vec<usize> {
        self.lock().insert_calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemorySinkInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RowSink for MemorySink {
    async fn prepare_table(
        &self,
        variant: StreamVariant,
        _mode: WriteMode,
        reset: bool,
    ) -> Result<(), SinkWriteError> {
        let mut inner = self.lock();
        let table = inner.tables.entry(variant.table_name()).or_default();
        if reset {
            table.clear();
        }
        Ok(())
    }

    async fn insert_rows(
        &self,
        variant: StreamVariant,
        mode: WriteMode,
        rows: &[SinkRow],
        ingest_time: NaiveDateTime,
    ) -> Result<u64, SinkWriteError> {
        let mut inner = self.lock();
        inner.insert_calls.push(rows.len());

        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(SinkWriteError::Rejected("injected failure".to_owned()));
        }

        let table = inner.tables.get_mut(variant.table_name()).ok_or_else(|| {
            SinkWriteError::Rejected(format!(
                "relation \"{}\" does not exist",
                variant.table_name()
            ))
        })?;

        let mut affected = 0;
        for row in rows.iter().filter(|row| row.variant() == variant) {
            let stored = StoredRow {
                row: row.clone(),
                ingest_time,
            };

            let existing = match mode {
                WriteMode::Insert => None,
                WriteMode::Upsert => table.iter_mut().find(|other| {
                    other.row.device_id() == row.device_id()
                        && other.row.event_time() == row.event_time()
                }),
            };

            match existing {
                Some(other) => *other = stored,
                None => table.push(stored),
            }
            affected += 1;
        }

        Ok(affected)
    }
}

/// Records of one read, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub received: usize,
    pub rows: Vec<SinkRow>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    pub received: usize,
    pub decoded: usize,
    pub skipped: usize,
    pub written: u64,
}

/// Decodes the records of a read and writes them with as few statements as
/// the page size allows.
pub struct SinkWriter<S> {
    sink: S,
    mode: WriteMode,
    page_size: usize,
}

impl<S: RowSink> SinkWriter<S> {
    pub fn new(sink: S, mode: WriteMode, page_size: usize) -> Self {
        Self {
            sink,
            mode,
            page_size: page_size.max(1),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Create the variant's table, dropping it first when `reset` is set.
    pub async fn prepare(&self, variant: StreamVariant, reset: bool) -> Result<(), SinkWriteError> {
        self.sink.prepare_table(variant, self.mode, reset).await
    }

    /// Every record either becomes a row or is logged and counted as skipped.
    pub fn decode_batch(&self, variant: StreamVariant, records: &[LogRecord]) -> DecodedBatch {
        let mut rows = Vec::with_capacity(records.len());
        let mut skipped = 0;

        for record in records {
            match variant.decode(&record.payload) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    skipped += 1;
                    metrics::counter!(DECODE_ERRORS, "variant" => variant.name()).increment(1);
                    warn!(
                        %variant,
                        partition_key = %record.partition_key,
                        sequence_number = record.sequence_number.as_deref().unwrap_or("-"),
                        "skipping undecodable record: {e}"
                    );
                }
            }
        }

        DecodedBatch {
            received: records.len(),
            rows,
            skipped,
        }
    }

    pub async fn write(
        &self,
        variant: StreamVariant,
        records: &[LogRecord],
    ) -> Result<WriteSummary, SinkWriteError> {
        let batch = self.decode_batch(variant, records);
        self.write_decoded(variant, &batch).await
    }

    pub async fn write_decoded(
        &self,
        variant: StreamVariant,
        batch: &DecodedBatch,
    ) -> Result<WriteSummary, SinkWriteError> {
        let mut summary = WriteSummary {
            received: batch.received,
            decoded: batch.rows.len(),
            skipped: batch.skipped,
            written: 0,
        };

        if batch.rows.is_empty() {
            return Ok(summary);
        }

        // One statement cannot update the same key twice.
        let rows = match self.mode {
            WriteMode::Insert => Cow::Borrowed(batch.rows.as_slice()),
            WriteMode::Upsert => Cow::Owned(keep_last_per_key(&batch.rows)),
        };
        let duplicates = batch.rows.len() - rows.len();
        if duplicates > 0 {
            metrics::counter!(DUPLICATES_IN_BATCH, "variant" => variant.name())
                .increment(duplicates as u64);
        }

        let ingest_time = Utc::now().naive_utc();
        for chunk in rows.chunks(self.page_size) {
            let start = Instant::now();
            let result = self
                .sink
                .insert_rows(variant, self.mode, chunk, ingest_time)
                .await;
            metrics::histogram!(SINK_WRITE_TIME, "variant" => variant.name())
                .record(start.elapsed().as_secs_f64());

            match result {
                Ok(affected) => {
                    summary.written += affected;
                    metrics::counter!(ROWS_WRITTEN, "variant" => variant.name()).increment(affected);
                }
                Err(e) => {
                    metrics::counter!(SINK_WRITE_ERRORS, "variant" => variant.name()).increment(1);
                    error!(
                        table = variant.table_name(),
                        rows = chunk.len(),
                        written = summary.written,
                        "sink write failed: {e}"
                    );
                    return Err(e);
                }
            }
        }

        debug!(table = variant.table_name(), ?summary, "batch written");
        Ok(summary)
    }
}

fn keep_last_per_key(rows: &[SinkRow]) -> Vec<SinkRow> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut kept: Vec<SinkRow> = rows
        .iter()
        .rev()
        .filter(|row| seen.insert((row.device_id().to_owned(), row.event_time())))
        .cloned()
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warning(device_id: &str, second: u32) -> LogRecord {
        let payload = format!(
            r#"{{"DEVICE_ID":"{device_id}","WARNING_ACCELERATION":1.5,"WARNING_TIME":"2021-03-24 10:15:{second:02}"}}"#
        );
        LogRecord::new(payload, device_id)
    }

    async fn writer(mode: WriteMode, page_size: usize) -> SinkWriter<MemorySink> {
        let writer = SinkWriter::new(MemorySink::new(), mode, page_size);
        writer
            .prepare(StreamVariant::WarningEvent, true)
            .await
            .unwrap();
        writer
    }

    #[test]
    fn test_parse_write_mode() {
        assert_eq!("insert".parse(), Ok(WriteMode::Insert));
        assert_eq!(" UPSERT ".parse(), Ok(WriteMode::Upsert));
        assert!("merge".parse::<WriteMode>().is_err());
    }

    #[tokio::test]
    async fn test_undecodable_records_are_counted_not_written() {
        let writer = writer(WriteMode::Insert, DEFAULT_PAGE_SIZE).await;
        let records = vec![
            warning("005", 1),
            LogRecord::new("{not json", "005"),
            warning("007", 2),
        ];

        let summary = writer
            .write(StreamVariant::WarningEvent, &records)
            .await
            .unwrap();

        assert_eq!(
            summary,
            WriteSummary {
                received: 3,
                decoded: 2,
                skipped: 1,
                written: 2,
            }
        );
        assert_eq!(writer.sink().row_count(StreamVariant::WarningEvent), 2);
        assert_eq!(writer.sink().insert_calls(), vec![2]);
    }

    #[tokio::test]
    async fn test_nothing_decoded_makes_no_sink_call() {
        let writer = writer(WriteMode::Insert, DEFAULT_PAGE_SIZE).await;
        let records = vec![LogRecord::new("[]", "005")];

        let summary = writer
            .write(StreamVariant::WarningEvent, &records)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.written, 0);
        assert!(writer.sink().insert_calls().is_empty());
    }

    #[tokio::test]
    async fn test_rows_are_chunked_by_page_size() {
        let writer = writer(WriteMode::Insert, 2).await;
        let records: Vec<_> = (0..5).map(|s| warning("005", s)).collect();

        let summary = writer
            .write(StreamVariant::WarningEvent, &records)
            .await
            .unwrap();

        assert_eq!(summary.written, 5);
        assert_eq!(writer.sink().insert_calls(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_insert_duplicates_upsert_does_not() {
        let records = vec![warning("005", 1), warning("007", 1), warning("005", 2)];

        let insert = writer(WriteMode::Insert, DEFAULT_PAGE_SIZE).await;
        insert.write(StreamVariant::WarningEvent, &records).await.unwrap();
        insert.write(StreamVariant::WarningEvent, &records).await.unwrap();
        assert_eq!(insert.sink().row_count(StreamVariant::WarningEvent), 6);

        let upsert = writer(WriteMode::Upsert, DEFAULT_PAGE_SIZE).await;
        upsert.write(StreamVariant::WarningEvent, &records).await.unwrap();
        upsert.write(StreamVariant::WarningEvent, &records).await.unwrap();
        assert_eq!(upsert.sink().row_count(StreamVariant::WarningEvent), 3);
    }

    #[tokio::test]
    async fn test_upsert_collapses_duplicates_within_a_batch() {
        let writer = writer(WriteMode::Upsert, DEFAULT_PAGE_SIZE).await;
        let records = vec![warning("005", 1), warning("005", 1), warning("007", 1)];

        let summary = writer
            .write(StreamVariant::WarningEvent, &records)
            .await
            .unwrap();

        assert_eq!(summary.decoded, 3);
        assert_eq!(summary.written, 2);
        assert_eq!(writer.sink().insert_calls(), vec![2]);
    }

    #[tokio::test]
    async fn test_failed_insert_is_reported() {
        let writer = writer(WriteMode::Insert, DEFAULT_PAGE_SIZE).await;
        writer.sink().fail_next_inserts(1);

        let result = writer
            .write(StreamVariant::WarningEvent, &[warning("005", 1)])
            .await;
        assert!(matches!(result, Err(SinkWriteError::Rejected(_))));

        writer
            .write(StreamVariant::WarningEvent, &[warning("005", 1)])
            .await
            .unwrap();
        assert_eq!(writer.sink().row_count(StreamVariant::WarningEvent), 1);
    }

    #[tokio::test]
    async fn test_unprepared_table_is_rejected() {
        let writer = SinkWriter::new(MemorySink::new(), WriteMode::Insert, DEFAULT_PAGE_SIZE);
        let result = writer
            .write(StreamVariant::AccelerationSample, &[warning("005", 1)])
            .await
            .map(|summary| summary.skipped);

        // Warning payloads do not decode as acceleration samples.
        assert_eq!(result.unwrap(), 1);

        let sample = LogRecord::new(
            r#"{"DEVICE_ID":"005","COUNT_ACCEL":32,"PEAK_ACCELERATION":0.5,"ACCELERATION_TIME":"2021-03-24 10:15:01"}"#,
            "005",
        );
        let result = writer
            .write(StreamVariant::AccelerationSample, &[sample])
            .await;
        assert!(matches!(result, Err(SinkWriteError::Rejected(_))));
    }
}
