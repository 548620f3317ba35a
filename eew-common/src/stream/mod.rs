//! Access to the partitioned, append-only log the services read from and write to.
//!
//! Consumers and producers only see the [`LogService`] trait. The production
//! implementation talks to Kinesis Data Streams ([`kinesis::KinesisLog`]); the
//! in-memory one ([`memory::MemoryLog`]) is always compiled so tests of the
//! other crates can drive the engine without AWS.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

pub mod kinesis;
pub mod memory;

/// A record as appended to, or read back from, a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub payload: Vec<u8>,
    pub partition_key: String,
    /// Assigned by the log service on append; `None` for records not yet appended.
    pub sequence_number: Option<String>,
}

impl LogRecord {
    pub fn new(payload: impl Into<Vec<u8>>, partition_key: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            partition_key: partition_key.into(),
            sequence_number: None,
        }
    }
}

/// Position within one shard of one stream. The token is issued by the log
/// service and must be treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub stream_id: String,
    pub shard_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Only records appended after the cursor was issued.
    Latest,
    /// The oldest record still retained by the shard.
    TrimHorizon,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStartPositionError(String);

impl fmt::Display for ParseStartPositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a start position, use latest or trim_horizon", self.0)
    }
}

impl FromStr for StartPosition {
    type Err = ParseStartPositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "latest" => Ok(StartPosition::Latest),
            "trim_horizon" | "earliest" => Ok(StartPosition::TrimHorizon),
            _ => Err(ParseStartPositionError(s.to_owned())),
        }
    }
}

/// Result of one bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub records: Vec<LogRecord>,
    /// `None` once the shard has been closed and fully read.
    pub next_cursor: Option<Cursor>,
    pub millis_behind_latest: Option<i64>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("stream {0} does not exist")]
    StreamNotFound(String),
    #[error("stream {0} has no shards")]
    NoShards(String),
    #[error("read or write throughput exceeded: {0}")]
    Throttled(String),
    #[error("cursor expired: {0}")]
    ExpiredCursor(String),
    #[error("log service unavailable: {0}")]
    Unavailable(String),
    #[error("{failed} of {total} records were rejected by the log service")]
    PartialAppend { failed: usize, total: usize },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl LogError {
    /// Errors that only describe the current call, retrying later may succeed.
    /// An expired cursor is not one of them: retrying it fails the same way.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LogError::Throttled(_) | LogError::Unavailable(_) | LogError::PartialAppend { .. }
        )
    }
}

#[async_trait]
pub trait LogService: Send + Sync {
    /// Shard ids of a stream, in the order the service lists them.
    async fn describe(&self, stream: &str) -> Result<Vec<String>, LogError>;

    async fn get_cursor(
        &self,
        stream: &str,
        shard_id: &str,
        position: StartPosition,
    ) -> Result<Cursor, LogError>;

    /// Read at most `limit` records at `cursor`.
    async fn read(&self, cursor: &Cursor, limit: usize) -> Result<ReadBatch, LogError>;

    async fn append(&self, stream: &str, record: LogRecord) -> Result<(), LogError>;

    /// One batched call for all `records`.
    async fn append_batch(&self, stream: &str, records: Vec<LogRecord>) -> Result<(), LogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_position() {
        assert_eq!("LATEST".parse(), Ok(StartPosition::Latest));
        assert_eq!("trim_horizon".parse(), Ok(StartPosition::TrimHorizon));
        assert_eq!("earliest".parse(), Ok(StartPosition::TrimHorizon));
        assert!("at_timestamp".parse::<StartPosition>().is_err());
    }

    #[test]
    fn test_transient_errors() {
        assert!(LogError::Throttled("shard-0".to_owned()).is_transient());
        assert!(LogError::Unavailable("timeout".to_owned()).is_transient());
        assert!(!LogError::StreamNotFound("OutputWarning".to_owned()).is_transient());
        assert!(!LogError::NoShards("OutputWarning".to_owned()).is_transient());
        assert!(!LogError::ExpiredCursor("shardId-000000000000".to_owned()).is_transient());
    }
}
