use std::time::Duration;

use eew_common::health::HealthRegistry;
use eew_common::stream::memory::MemoryLog;
use eew_common::stream::{LogRecord, LogService, StartPosition};
use eew_consumer::alert::{AlertGate, AlertPolicy};
use eew_consumer::consumer::{
    ConsumerSettings, ConsumerState, CursorAdvance, StreamConsumer, TickOutcome,
};
use eew_consumer::cursor::PositionCursorSource;
use eew_consumer::notify::{NotificationDispatcher, RecordingTransport};
use eew_consumer::rate::RateScheduler;
use eew_consumer::sink::{MemorySink, SinkWriter, WriteMode};
use eew_consumer::variant::StreamVariant;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const ACCEL_STREAM: &str = "OutputAccelerations";
const WARNING_STREAM: &str = "OutputWarning";
const TOPIC: &str = "arn:aws:sns:us-west-2:123456789012:earthquake-alerts";

type TestConsumer = StreamConsumer<MemoryLog, MemorySink, RecordingTransport>;

fn sample(device_id: &str, second: u32, peak: f64) -> LogRecord {
    let payload = json!({
        "DEVICE_ID": device_id,
        "COUNT_ACCEL": 32,
        "PEAK_ACCELERATION": peak,
        "ACCELERATION_TIME": format!("2021-03-24 10:{:02}:{:02}.000", second / 60, second % 60),
    });
    LogRecord::new(payload.to_string(), device_id)
}

fn warning(device_id: &str, second: u32, recovered: bool) -> LogRecord {
    let payload = json!({
        "DEVICE_ID": device_id,
        "WARNING_ACCELERATION": 3.25,
        "WARNING_TIME": format!("2021-03-24 10:15:{second:02}"),
        "RECOVERED": recovered,
    });
    LogRecord::new(payload.to_string(), device_id)
}

async fn build(
    log: &MemoryLog,
    stream: &str,
    variant: StreamVariant,
    mode: WriteMode,
    policy: AlertPolicy,
) -> TestConsumer {
    let writer = SinkWriter::new(MemorySink::new(), mode, 1000);
    writer.prepare(variant, true).await.unwrap();

    let mut consumer = StreamConsumer::new(
        log.clone(),
        ConsumerSettings {
            stream: stream.to_owned(),
            variant,
            read_limit: 100,
            cursor_advance: CursorAdvance::Always,
        },
        Box::new(PositionCursorSource::new(StartPosition::TrimHorizon)),
        RateScheduler::per_second(5),
        writer,
    )
    .with_alerts(
        AlertGate::new(policy),
        NotificationDispatcher::new(RecordingTransport::new(), TOPIC, Duration::from_secs(5)),
    );
    consumer.initialize().await.unwrap();
    consumer
}

#[tokio::test]
async fn test_backlog_is_drained_in_bounded_reads() {
    let log = MemoryLog::new().with_stream(ACCEL_STREAM, 1);
    let backlog: Vec<_> = (0..250).map(|s| sample("005", s, 0.01)).collect();
    log.append_batch(ACCEL_STREAM, backlog).await.unwrap();

    let mut consumer = build(
        &log,
        ACCEL_STREAM,
        StreamVariant::AccelerationSample,
        WriteMode::Insert,
        AlertPolicy::OneShot,
    )
    .await;

    let mut per_read = Vec::new();
    for _ in 0..4 {
        match consumer.tick().await.unwrap() {
            TickOutcome::Processed { records, .. } => per_read.push(records),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(per_read, vec![100, 100, 50, 0]);
    assert_eq!(
        consumer
            .writer()
            .sink()
            .row_count(StreamVariant::AccelerationSample),
        250
    );
    assert_eq!(consumer.writer().sink().insert_calls(), vec![100, 100, 50]);
    assert_eq!(consumer.gate().tracked(), 0);
}

#[tokio::test]
async fn test_redelivered_batch_is_idempotent_with_upsert() {
    let log = MemoryLog::new().with_stream(ACCEL_STREAM, 1);
    let batch: Vec<_> = (0..10).map(|s| sample("007", s, 0.02)).collect();
    log.append_batch(ACCEL_STREAM, batch.clone()).await.unwrap();
    // The producer retried the whole batch.
    log.append_batch(ACCEL_STREAM, batch).await.unwrap();

    let mut upsert = build(
        &log,
        ACCEL_STREAM,
        StreamVariant::AccelerationSample,
        WriteMode::Upsert,
        AlertPolicy::OneShot,
    )
    .await;
    upsert.tick().await.unwrap();
    assert_eq!(
        upsert
            .writer()
            .sink()
            .row_count(StreamVariant::AccelerationSample),
        10
    );

    let mut insert = build(
        &log,
        ACCEL_STREAM,
        StreamVariant::AccelerationSample,
        WriteMode::Insert,
        AlertPolicy::OneShot,
    )
    .await;
    insert.tick().await.unwrap();
    assert_eq!(
        insert
            .writer()
            .sink()
            .row_count(StreamVariant::AccelerationSample),
        20
    );
}

#[tokio::test]
async fn test_recovery_starts_a_new_episode() {
    let log = MemoryLog::new().with_stream(WARNING_STREAM, 1);
    let mut consumer = build(
        &log,
        WARNING_STREAM,
        StreamVariant::WarningEvent,
        WriteMode::Insert,
        AlertPolicy::ResetOnRecovery,
    )
    .await;

    let ticks = [
        warning("005", 1, false),
        warning("005", 2, false),
        warning("005", 3, true),
        warning("005", 9, false),
    ];

    let mut notified = Vec::new();
    for record in ticks {
        log.append(WARNING_STREAM, record).await.unwrap();
        match consumer.tick().await.unwrap() {
            TickOutcome::Processed { notified: n, .. } => notified.push(n),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(notified, vec![true, false, false, true]);
    assert_eq!(
        consumer.writer().sink().row_count(StreamVariant::WarningEvent),
        4
    );
}

#[tokio::test]
async fn test_recovery_behind_first_record_rearms_device() {
    let log = MemoryLog::new().with_stream(WARNING_STREAM, 1);
    let mut consumer = build(
        &log,
        WARNING_STREAM,
        StreamVariant::WarningEvent,
        WriteMode::Insert,
        AlertPolicy::ResetOnRecovery,
    )
    .await;

    let ticks = [
        vec![warning("005", 1, false)],
        vec![warning("005", 2, false), warning("005", 3, true)],
        vec![warning("005", 4, false)],
    ];

    let mut notified = Vec::new();
    for batch in ticks {
        log.append_batch(WARNING_STREAM, batch).await.unwrap();
        match consumer.tick().await.unwrap() {
            TickOutcome::Processed { notified: n, .. } => notified.push(n),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(notified, vec![true, false, true]);
    assert_eq!(consumer.gate().tracked(), 1);
}

#[tokio::test]
async fn test_one_shot_never_alerts_twice() {
    let log = MemoryLog::new().with_stream(WARNING_STREAM, 1);
    let mut consumer = build(
        &log,
        WARNING_STREAM,
        StreamVariant::WarningEvent,
        WriteMode::Insert,
        AlertPolicy::OneShot,
    )
    .await;

    for (second, recovered) in [(1, false), (2, true), (3, false)] {
        log.append(WARNING_STREAM, warning("005", second, recovered))
            .await
            .unwrap();
        consumer.tick().await.unwrap();
    }

    assert!(consumer.gate().last_notified("005").is_some());
    assert_eq!(consumer.gate().tracked(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_consumes_live_appends_and_reports_liveness() {
    let log = MemoryLog::new().with_stream(WARNING_STREAM, 1);
    let registry = HealthRegistry::new("liveness");
    let handle = registry.register("stream_consumer", Duration::from_secs(30));

    let mut consumer = build(
        &log,
        WARNING_STREAM,
        StreamVariant::WarningEvent,
        WriteMode::Insert,
        AlertPolicy::OneShot,
    )
    .await
    .with_liveness(handle);

    let shutdown = CancellationToken::new();
    let producer_log = log.clone();
    let producer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        for (second, device) in ["005", "007", "005", "011"].iter().enumerate() {
            tokio::time::sleep(Duration::from_millis(1250)).await;
            let second = u32::try_from(second).unwrap();
            producer_log
                .append(WARNING_STREAM, warning(device, second, false))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        producer_shutdown.cancel();
    });

    consumer.run(shutdown).await.unwrap();

    assert_ne!(consumer.state(), ConsumerState::Terminated);
    assert_eq!(
        consumer.writer().sink().row_count(StreamVariant::WarningEvent),
        4
    );
    assert_eq!(consumer.gate().tracked(), 3);
    assert!(registry.get_status().healthy);
}
