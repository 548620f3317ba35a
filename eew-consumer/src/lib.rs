//! Consumes one analytics output stream: rate-limited shard reads, batched
//! writes into Postgres and one alert per device and warning episode.

pub mod alert;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod error;
pub mod metrics_consts;
pub mod notify;
pub mod rate;
pub mod sink;
pub mod variant;
