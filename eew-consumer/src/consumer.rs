use std::fmt;
use std::str::FromStr;

use eew_common::health::HealthHandle;
use eew_common::stream::{Cursor, LogError, LogService};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::AlertGate;
use crate::cursor::CursorSource;
use crate::error::ConsumerError;
use crate::metrics_consts::{
    MILLIS_BEHIND_LATEST, POLL_TICKS, READS_DEFERRED, READ_ERRORS, RECORDS_READ,
};
use crate::notify::{AlertMessage, NotificationDispatcher, NotificationTransport};
use crate::rate::RateScheduler;
use crate::sink::{DecodedBatch, RowSink, SinkWriter};
use crate::variant::{SinkRow, StreamVariant};

/// When the cursor moves past a batch whose sink write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorAdvance {
    /// After every successful read. A failed write loses that batch.
    #[default]
    Always,
    /// Only once the batch is written; a failed write re-reads it next tick.
    OnWriteSuccess,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCursorAdvanceError(String);

impl fmt::Display for ParseCursorAdvanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is not a cursor advance mode, use always or on_write_success",
            self.0
        )
    }
}

impl FromStr for CursorAdvance {
    type Err = ParseCursorAdvanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(CursorAdvance::Always),
            "on_write_success" => Ok(CursorAdvance::OnWriteSuccess),
            _ => Err(ParseCursorAdvanceError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Initializing,
    Polling,
    WaitingForToken,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A read went through; `records` may be zero.
    Processed {
        records: usize,
        written: u64,
        notified: bool,
    },
    /// No read budget left, try again at `retry_at`.
    Deferred { retry_at: Instant },
    /// The read failed with a transient error; the cursor did not move.
    ReadFailed,
}

pub struct ConsumerSettings {
    pub stream: String,
    pub variant: StreamVariant,
    pub read_limit: usize,
    pub cursor_advance: CursorAdvance,
}

/// Polls one shard of one stream: read within the rate budget, write what was
/// read to the sink, alert on warnings, move the cursor.
pub struct StreamConsumer<L, S, T> {
    log: L,
    settings: ConsumerSettings,
    cursor_source: Box<dyn CursorSource>,
    scheduler: RateScheduler,
    writer: SinkWriter<S>,
    gate: AlertGate,
    dispatcher: Option<NotificationDispatcher<T>>,
    liveness: Option<HealthHandle>,
    state: ConsumerState,
    cursor: Option<Cursor>,
}

impl<L, S, T> StreamConsumer<L, S, T>
where
    L: LogService,
    S: RowSink,
    T: NotificationTransport,
{
    pub fn new(
        log: L,
        settings: ConsumerSettings,
        cursor_source: Box<dyn CursorSource>,
        scheduler: RateScheduler,
        writer: SinkWriter<S>,
    ) -> Self {
        Self {
            log,
            settings,
            cursor_source,
            scheduler,
            writer,
            gate: AlertGate::default(),
            dispatcher: None,
            liveness: None,
            state: ConsumerState::Initializing,
            cursor: None,
        }
    }

    pub fn with_alerts(mut self, gate: AlertGate, dispatcher: NotificationDispatcher<T>) -> Self {
        self.gate = gate;
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn gate(&self) -> &AlertGate {
        &self.gate
    }

    pub fn writer(&self) -> &SinkWriter<S> {
        &self.writer
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Resolve the shard and the starting cursor. Failure terminates the consumer.
    pub async fn initialize(&mut self) -> Result<(), ConsumerError> {
        let stream = &self.settings.stream;

        match self.cursor_source.initial_cursor(&self.log, stream).await {
            Ok(cursor) => {
                info!(
                    stream,
                    shard_id = %cursor.shard_id,
                    variant = %self.settings.variant,
                    "consumer initialized"
                );
                self.cursor = Some(cursor);
                self.state = ConsumerState::Polling;
                Ok(())
            }
            Err(source) => {
                self.state = ConsumerState::Terminated;
                Err(ConsumerError::FatalInit {
                    stream: stream.clone(),
                    source,
                })
            }
        }
    }

    /// One pass of the poll loop. Errors are fatal; everything recoverable is
    /// logged and reported through the outcome.
    ///
    /// A read error that retrying cannot fix (expired cursor, stream deleted
    /// after start) terminates the consumer. It is not re-initialized from the
    /// `CursorSource`: with `TRIM_HORIZON` that restarts at an earlier
    /// position, with `LATEST` it silently skips records.
    pub async fn tick(&mut self) -> Result<TickOutcome, ConsumerError> {
        let cursor = match (self.state, &self.cursor) {
            (ConsumerState::Initializing, _) | (_, None) => {
                return Err(ConsumerError::NotInitialized)
            }
            (ConsumerState::Terminated, Some(cursor)) => {
                return Err(ConsumerError::ShardClosed(cursor.shard_id.clone()))
            }
            (_, Some(cursor)) => cursor.clone(),
        };

        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
        metrics::counter!(POLL_TICKS).increment(1);

        if !self.scheduler.acquire() {
            let retry_at = self.scheduler.next_permit_at();
            self.state = ConsumerState::WaitingForToken;
            metrics::counter!(READS_DEFERRED).increment(1);
            return Ok(TickOutcome::Deferred { retry_at });
        }
        self.state = ConsumerState::Polling;

        let batch = match self.log.read(&cursor, self.settings.read_limit).await {
            Ok(batch) => batch,
            Err(e) if e.is_transient() => {
                metrics::counter!(READ_ERRORS, "kind" => "transient").increment(1);
                warn!(stream = %self.settings.stream, "read failed, retrying next tick: {e}");
                return Ok(TickOutcome::ReadFailed);
            }
            Err(e) => {
                metrics::counter!(READ_ERRORS, "kind" => "fatal").increment(1);
                error!(stream = %self.settings.stream, "read failed: {e}");
                self.state = ConsumerState::Terminated;
                return Err(ConsumerError::Read(e));
            }
        };

        let records = batch.records.len();
        metrics::counter!(RECORDS_READ, "stream" => self.settings.stream.clone())
            .increment(records as u64);
        if let Some(behind) = batch.millis_behind_latest {
            metrics::gauge!(MILLIS_BEHIND_LATEST, "stream" => self.settings.stream.clone())
                .set(behind as f64);
        }

        let mut written = 0;
        let mut notified = false;
        let mut write_ok = true;

        if records > 0 {
            let variant = self.settings.variant;
            let decoded = self.writer.decode_batch(variant, &batch.records);

            match self.writer.write_decoded(variant, &decoded).await {
                Ok(summary) => written = summary.written,
                // Already logged and counted by the writer.
                Err(_) => write_ok = false,
            }

            if variant.raises_alerts() {
                notified = self.alert(&decoded).await;
            }

            debug!(
                stream = %self.settings.stream,
                records,
                written,
                first_sequence = batch.records[0].sequence_number.as_deref().unwrap_or("-"),
                "batch processed"
            );
        }

        let Some(next) = batch.next_cursor else {
            warn!(stream = %self.settings.stream, shard_id = %cursor.shard_id, "shard closed");
            self.state = ConsumerState::Terminated;
            return Err(ConsumerError::ShardClosed(cursor.shard_id));
        };

        if write_ok || self.settings.cursor_advance == CursorAdvance::Always {
            self.cursor_source.advanced(&next).await;
            self.cursor = Some(next);
        } else {
            warn!(stream = %self.settings.stream, records, "sink write failed, batch will be read again");
        }

        Ok(TickOutcome::Processed {
            records,
            written,
            notified,
        })
    }

    /// Only the first warning of a batch can notify; the ones behind it in the
    /// same read belong to the same episode. Recoveries later in the batch
    /// still re-arm their devices.
    async fn alert(&mut self, decoded: &DecodedBatch) -> bool {
        let mut warnings = decoded.rows.iter().filter_map(SinkRow::as_warning);
        let Some(warning) = warnings.next() else {
            return false;
        };

        let notify = self.gate.observe(warning);
        for recovery in warnings.filter(|w| w.recovered) {
            self.gate.record_recovery(&recovery.device_id);
        }

        if !notify {
            return false;
        }

        let message = AlertMessage::from(warning);
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.publish(&message).await,
            None => {
                warn!(device_id = %message.device_id, "no alert topic configured, alert dropped");
                false
            }
        }
    }

    /// Poll until `shutdown` is cancelled or a fatal error occurs. Cancellation
    /// is observed between ticks.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        if self.state == ConsumerState::Initializing {
            self.initialize().await?;
        }

        loop {
            if shutdown.is_cancelled() {
                info!(stream = %self.settings.stream, "consumer shutting down");
                return Ok(());
            }

            match self.tick().await? {
                TickOutcome::Deferred { retry_at } => tokio::time::sleep_until(retry_at).await,
                TickOutcome::Processed { .. } | TickOutcome::ReadFailed => {}
            }
        }
    }
}
