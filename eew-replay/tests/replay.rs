use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use eew_common::health::HealthRegistry;
use eew_common::stream::memory::MemoryLog;
use eew_replay::archive::{object_key, MemoryArchive, Reading};
use eew_replay::replayer::Replayer;
use eew_replay::source::ReplaySource;
use eew_replay::writer::{BatchedLogWriter, SendSummary};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "grillo-openeew";
const STREAM: &str = "InputReadings";

// 2020-01-05 04:41:00 UTC
const MINUTE_41: f64 = 1_578_199_260.0;

fn minute(m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 5, 4, m, 0).unwrap()
}

fn line(device_id: &str, cloud_t: f64, sr: f64, xs: &[f64]) -> String {
    json!({
        "device_id": device_id,
        "cloud_t": cloud_t,
        "sr": sr,
        "x": xs,
        "y": xs,
        "z": xs,
    })
    .to_string()
}

fn archive() -> MemoryArchive {
    let minute_41 = [
        line("005", MINUTE_41 + 30.0, 2.0, &[3.0, 4.0]),
        line("005", MINUTE_41 + 1.0, 2.0, &[1.0, 2.0]),
        // First sample predates the window.
        line("005", MINUTE_41 + 0.25, 1.0, &[9.0, 10.0]),
        line("007", MINUTE_41 + 10.0, 1.0, &[99.0]),
    ]
    .join("\n");
    let minute_42 = [
        // Received after the window closed, first sample taken inside it.
        line("005", MINUTE_41 + 60.5, 1.0, &[5.0, 6.0]),
        line("005", MINUTE_41 + 60.0, 1.0, &[7.0]),
    ]
    .join("\n");

    MemoryArchive::new()
        .with_object(BUCKET, &object_key("mx", "005", minute(41)), minute_41)
        .with_object(BUCKET, &object_key("mx", "005", minute(42)), minute_42)
}

fn xs(readings: &[Reading]) -> Vec<f64> {
    readings.iter().map(|r| r.x).collect()
}

#[tokio::test(start_paused = true)]
async fn test_send_batches_paced_readings() {
    let log = MemoryLog::new().with_stream(STREAM, 1);
    let interval = Duration::from_secs_f64(1.0 / 32.0);
    let writer = BatchedLogWriter::new(log.clone(), STREAM, 20, interval);
    let readings: Vec<Reading> = (0..45)
        .map(|i| Reading {
            device_id: "005".to_owned(),
            x: 0.0,
            y: 0.0,
            z: 1.0,
            sample_t: MINUTE_41 + f64::from(i) / 32.0,
        })
        .collect();

    let started = tokio::time::Instant::now();
    let summary = writer.send(&readings).await;
    let elapsed = started.elapsed();

    assert_eq!(log.appended_batches(), vec![20, 20, 5]);
    assert_eq!(
        summary,
        SendSummary {
            emitted: 45,
            batches: 3,
            failed_batches: 0,
            failed_records: 0,
        }
    );
    // The first emission is immediate, the other 44 wait one interval each.
    assert!(elapsed >= Duration::from_millis(1375), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1400), "{elapsed:?}");
}

#[tokio::test]
async fn test_read_window_orders_and_bounds_samples() {
    let archive = archive();
    let source = ReplaySource::new(archive.clone(), BUCKET, "mx");

    let readings = source.read_window(minute(41), minute(42), "005").await.unwrap();

    assert_eq!(xs(&readings), vec![10.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert!(readings
        .windows(2)
        .all(|pair| pair[0].sample_t <= pair[1].sample_t));
    assert_eq!(readings[0].sample_t, MINUTE_41 + 0.25);
    assert_eq!(readings[5].sample_t, MINUTE_41 + 59.5);
    assert_eq!(
        archive.requested(),
        vec![
            object_key("mx", "005", minute(41)),
            object_key("mx", "005", minute(42)),
        ]
    );
}

#[tokio::test]
async fn test_missing_minute_is_no_data() {
    let archive = MemoryArchive::new().with_object(
        BUCKET,
        &object_key("mx", "005", minute(42)),
        line("005", MINUTE_41 + 60.5, 1.0, &[5.0, 6.0]),
    );
    let source = ReplaySource::new(archive.clone(), BUCKET, "mx");

    let readings = source.read_window(minute(41), minute(42), "005").await.unwrap();

    assert_eq!(xs(&readings), vec![5.0]);
    assert_eq!(archive.requested().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_replayer_publishes_window_in_sample_order() {
    let log = MemoryLog::new().with_stream(STREAM, 1);
    let registry = HealthRegistry::new("liveness");
    let handle = registry.register("replay", Duration::from_secs(30));

    let replayer = Replayer::new(
        ReplaySource::new(archive(), BUCKET, "mx"),
        BatchedLogWriter::new(log.clone(), STREAM, 4, Duration::from_secs_f64(1.0 / 32.0))
            .with_liveness(handle.clone()),
        "005",
        minute(41),
        minute(41) + TimeDelta::seconds(90),
        60,
    )
    .with_liveness(handle);

    let summary = replayer.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.windows, 2);
    // The second window starts exactly at a sample taken at 04:42:00.
    assert_eq!(summary.sent.emitted, 8);
    assert_eq!(log.appended_batches(), vec![4, 2, 2]);

    let published: Vec<Reading> = log
        .records(STREAM)
        .iter()
        .map(|record| serde_json::from_slice(&record.payload).unwrap())
        .collect();
    assert_eq!(xs(&published), vec![10.0, 1.0, 2.0, 3.0, 4.0, 5.0, 7.0, 6.0]);
    assert!(published.iter().all(|r| r.device_id == "005"));
    assert!(registry.get_status().healthy);
}
