use std::time::Duration;

use eew_common::stream::LogError;
use thiserror::Error;

/// A record payload that could not be turned into a sink row. The record is
/// skipped, the rest of the batch is still written.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid {variant} payload: {source}")]
    Json {
        variant: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("device id is empty")]
    EmptyDeviceId,
    #[error("device id {0:?} is longer than 5 characters")]
    DeviceIdTooLong(String),
}

#[derive(Error, Debug)]
pub enum SinkWriteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sink rejected the batch: {0}")]
    Rejected(String),
}

/// Notification failures are logged and dropped, never retried.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("notification service error: {0}")]
    Service(String),
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid subscriber {0:?}, expected protocol:endpoint")]
    InvalidSubscriber(String),
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to initialize consumer for {stream}: {source}")]
    FatalInit {
        stream: String,
        #[source]
        source: LogError,
    },
    #[error("consumer polled before initialization")]
    NotInitialized,
    #[error("shard {0} was closed")]
    ShardClosed(String),
    #[error("unrecoverable read error: {0}")]
    Read(LogError),
}
