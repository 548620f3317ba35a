use std::time::{Duration, Instant};

use eew_common::health::HealthHandle;
use eew_common::stream::{LogError, LogRecord, LogService};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::archive::Reading;
use crate::metrics_consts::{
    BATCHES_FLUSHED, BATCH_FLUSH_ERRORS, BATCH_FLUSH_TIME, READINGS_EMITTED,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub emitted: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub failed_records: usize,
}

impl SendSummary {
    pub fn merge(&mut self, other: SendSummary) {
        self.emitted += other.emitted;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.failed_records += other.failed_records;
    }
}

/// Publishes readings to a log stream at the rate a sensor would produce
/// them, grouped into batched appends.
pub struct BatchedLogWriter<L> {
    log: L,
    stream: String,
    batch_size: usize,
    interval: Duration,
    liveness: Option<HealthHandle>,
}

impl<L: LogService> BatchedLogWriter<L> {
    /// `interval` is the pause between two emissions; zero sends as fast as
    /// the log accepts.
    pub fn new(log: L, stream: impl Into<String>, batch_size: usize, interval: Duration) -> Self {
        Self {
            log,
            stream: stream.into(),
            batch_size: batch_size.max(1),
            interval,
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub async fn send(&self, readings: &[Reading]) -> SendSummary {
        self.send_until(readings, &CancellationToken::new()).await
    }

    /// Like `send`, but stops emitting once `shutdown` fires. Readings already
    /// emitted are still flushed.
    pub async fn send_until(
        &self,
        readings: &[Reading],
        shutdown: &CancellationToken,
    ) -> SendSummary {
        let mut summary = SendSummary::default();
        let mut pacing = (!self.interval.is_zero()).then(|| {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut batch = Vec::with_capacity(self.batch_size);

        for reading in readings {
            match pacing.as_mut() {
                Some(ticker) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                }
                None if shutdown.is_cancelled() => break,
                None => {}
            }

            let payload = match serde_json::to_vec(reading) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(device_id = %reading.device_id, "failed to serialize reading: {e}");
                    continue;
                }
            };
            batch.push(LogRecord::new(payload, reading.device_id.as_str()));
            summary.emitted += 1;

            if batch.len() >= self.batch_size {
                self.flush(&mut batch, &mut summary).await;
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, &mut summary).await;
        }

        metrics::counter!(READINGS_EMITTED).increment(summary.emitted as u64);
        summary
    }

    async fn flush(&self, batch: &mut Vec<LogRecord>, summary: &mut SendSummary) {
        let records: Vec<LogRecord> = batch.drain(..).collect();
        let count = records.len();
        let started = Instant::now();

        match self.log.append_batch(&self.stream, records).await {
            Ok(()) => {
                summary.batches += 1;
                metrics::counter!(BATCHES_FLUSHED).increment(1);
                debug!(stream = %self.stream, count, "flushed batch");
            }
            Err(e) => {
                // A partial append only lost the rejected entries.
                let lost = match &e {
                    LogError::PartialAppend { failed, .. } => (*failed).min(count),
                    _ => count,
                };
                summary.failed_batches += 1;
                summary.failed_records += lost;
                metrics::counter!(BATCH_FLUSH_ERRORS).increment(1);
                error!(stream = %self.stream, count, lost, "failed to append batch: {e}");
            }
        }
        metrics::histogram!(BATCH_FLUSH_TIME).record(started.elapsed().as_secs_f64());

        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }
}
