//! Shared plumbing for the earthquake early warning services: the log service
//! abstraction (Kinesis and in-memory), environment configuration pieces,
//! health reporting, shutdown signals and the metrics/health HTTP server.

pub mod config;
pub mod health;
pub mod metrics;
pub mod signals;
pub mod stream;

/// Install the fmt subscriber filtered by `RUST_LOG`.
pub fn setup_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}
