use chrono::{DateTime, TimeDelta, Utc};
use eew_common::health::HealthHandle;
use eew_common::stream::LogService;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::archive::ArchiveStore;
use crate::error::ReplayError;
use crate::metrics_consts::{WINDOWS_REPLAYED, WINDOW_ERRORS};
use crate::source::ReplaySource;
use crate::writer::{BatchedLogWriter, SendSummary};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub windows: usize,
    pub failed_windows: usize,
    pub sent: SendSummary,
}

/// Replays one device's archived samples over `[start, end)`, one window at
/// a time. A window is read only after the previous one was fully sent.
pub struct Replayer<A, L> {
    source: ReplaySource<A>,
    writer: BatchedLogWriter<L>,
    device_id: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window: TimeDelta,
    liveness: Option<HealthHandle>,
}

impl<A: ArchiveStore, L: LogService> Replayer<A, L> {
    pub fn new(
        source: ReplaySource<A>,
        writer: BatchedLogWriter<L>,
        device_id: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window_secs: u32,
    ) -> Self {
        Self {
            source,
            writer,
            device_id: device_id.into(),
            start,
            end,
            window: TimeDelta::seconds(i64::from(window_secs.max(1))),
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn writer(&self) -> &BatchedLogWriter<L> {
        &self.writer
    }

    /// Window boundaries covering `[start, end)`; the last window is cut at `end`.
    pub fn windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let mut windows = Vec::new();
        let mut window_start = self.start;
        while window_start < self.end {
            let window_end = (window_start + self.window).min(self.end);
            windows.push((window_start, window_end));
            window_start = window_end;
        }
        windows
    }

    /// Fails only if the input stream cannot be found. A window that cannot be
    /// read is logged and skipped.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<ReplaySummary, ReplayError> {
        let shards = self.writer.log().describe(self.writer.stream()).await?;
        info!(
            stream = self.writer.stream(),
            shards = shards.len(),
            device_id = %self.device_id,
            start = %self.start,
            end = %self.end,
            "starting replay"
        );

        let mut summary = ReplaySummary::default();
        for (window_start, window_end) in self.windows() {
            if shutdown.is_cancelled() {
                info!(%window_start, "replay cancelled");
                break;
            }

            let readings = match self
                .source
                .read_window(window_start, window_end, &self.device_id)
                .await
            {
                Ok(readings) => readings,
                Err(e) => {
                    summary.failed_windows += 1;
                    metrics::counter!(WINDOW_ERRORS).increment(1);
                    error!(%window_start, %window_end, "failed to read window: {e}");
                    continue;
                }
            };

            let sent = self.writer.send_until(&readings, shutdown).await;
            info!(
                %window_start,
                %window_end,
                emitted = sent.emitted,
                failed_records = sent.failed_records,
                "replayed window"
            );
            summary.sent.merge(sent);
            summary.windows += 1;
            metrics::counter!(WINDOWS_REPLAYED).increment(1);

            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }
        }

        Ok(summary)
    }
}
