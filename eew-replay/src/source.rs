use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::archive::{object_key, ArchiveRecord, ArchiveStore, Reading};
use crate::error::{ArchiveError, ReplayError};
use crate::metrics_consts::{ARCHIVE_LINES_SKIPPED, ARCHIVE_OBJECTS_MISSING, ARCHIVE_OBJECTS_READ};

// Per-minute objects fetched concurrently; results keep key order.
const FETCH_CONCURRENCY: usize = 4;

/// Reads time windows of one device's samples out of the archive.
pub struct ReplaySource<A> {
    archive: A,
    bucket: String,
    country: String,
}

impl<A: ArchiveStore> ReplaySource<A> {
    pub fn new(archive: A, bucket: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            archive,
            bucket: bucket.into(),
            country: country.into(),
        }
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    /// Samples of `device_id` taken in `[start, end)`, oldest first.
    ///
    /// An upload is filed under the minute it was received in, which can be
    /// after the samples it carries were taken, so the object for the minute
    /// containing `end` is read too. Missing objects hold no data.
    pub async fn read_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        device_id: &str,
    ) -> Result<Vec<Reading>, ReplayError> {
        if end <= start {
            return Ok(Vec::new());
        }

        let first_minute = start.timestamp().div_euclid(60);
        let last_minute = end.timestamp().div_euclid(60);
        let keys: Vec<String> = (first_minute..=last_minute)
            .filter_map(|minute| DateTime::from_timestamp(minute * 60, 0))
            .map(|minute| object_key(&self.country, device_id, minute))
            .collect();

        let bodies: Vec<Result<Option<String>, ArchiveError>> = stream::iter(&keys)
            .map(|key| self.fetch(key))
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let window_start = epoch_seconds(start);
        let window_end = epoch_seconds(end);

        let mut readings = Vec::new();
        for (key, body) in keys.iter().zip(bodies) {
            let Some(body) = body? else {
                continue;
            };

            for reading in parse_object(key, &body) {
                if reading.device_id == device_id
                    && reading.sample_t >= window_start
                    && reading.sample_t < window_end
                {
                    readings.push(reading);
                }
            }
        }

        readings.sort_by(|a, b| a.sample_t.total_cmp(&b.sample_t));
        debug!(
            device_id,
            %start,
            %end,
            objects = keys.len(),
            readings = readings.len(),
            "read archive window"
        );
        Ok(readings)
    }

    async fn fetch(&self, key: &str) -> Result<Option<String>, ArchiveError> {
        match self.archive.get_string(&self.bucket, key).await {
            Ok(body) => {
                metrics::counter!(ARCHIVE_OBJECTS_READ).increment(1);
                Ok(Some(body))
            }
            Err(ArchiveError::NotFound(_)) => {
                metrics::counter!(ARCHIVE_OBJECTS_MISSING).increment(1);
                debug!(key, "no archive object");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Expand every line of an object into readings, skipping lines that do not parse.
fn parse_object(key: &str, body: &str) -> Vec<Reading> {
    let mut readings = Vec::new();
    for (line_number, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let parsed = serde_json::from_str::<ArchiveRecord>(line)
            .map_err(|e| ArchiveError::ParseError(e.to_string()))
            .and_then(|record| record.readings());

        match parsed {
            Ok(mut expanded) => readings.append(&mut expanded),
            Err(e) => {
                metrics::counter!(ARCHIVE_LINES_SKIPPED).increment(1);
                warn!(key, line = line_number + 1, "skipping archive line: {e}");
            }
        }
    }
    readings
}

pub(crate) fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}
