use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use eew_common::config::{AwsConfig, EnvMsDuration, NonEmptyString, ServerConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub server: ServerConfig,

    #[envconfig(nested = true)]
    pub aws: AwsConfig,

    #[envconfig(default = "InputReadings")]
    pub input_stream: NonEmptyString,

    #[envconfig(default = "005")]
    pub device: NonEmptyString,

    #[envconfig(default = "2020-01-05 04:41:00")]
    pub replay_start: UtcTimestamp,

    #[envconfig(default = "2020-01-05 04:42:00")]
    pub replay_end: UtcTimestamp,

    #[envconfig(default = "60")]
    pub replay_window_secs: u32,

    #[envconfig(default = "32")]
    pub sample_rate_hz: f64,

    #[envconfig(default = "20")]
    pub log_batch_size: usize,

    #[envconfig(default = "grillo-openeew")]
    pub archive_bucket: String,

    #[envconfig(default = "mx")]
    pub archive_country: String,

    #[envconfig(default = "30000")]
    pub liveness_deadline_ms: EnvMsDuration,
}

impl Config {
    /// Pause between two emitted readings. A rate that is not positive
    /// disables pacing.
    pub fn emission_interval(&self) -> Duration {
        if self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / self.sample_rate_hz)
        } else {
            Duration::ZERO
        }
    }
}

/// A UTC instant given as `YYYY-MM-DD HH:MM:SS` or RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcTimestamp(pub DateTime<Utc>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseUtcTimestampError(String);

impl fmt::Display for ParseUtcTimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid timestamp {:?}, expected YYYY-MM-DD HH:MM:SS", self.0)
    }
}

impl FromStr for UtcTimestamp {
    type Err = ParseUtcTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Ok(UtcTimestamp(naive.and_utc()));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|at| UtcTimestamp(at.with_timezone(&Utc)))
            .map_err(|_| ParseUtcTimestampError(s.to_owned()))
    }
}
