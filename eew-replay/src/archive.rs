//! Read access to the OpenEEW accelerometer archive.
//!
//! The archive holds one JSON-lines object per device and minute. Every line
//! is one upload from a sensor: a burst of samples on three axes, stamped with
//! the time the cloud received it and the sampling rate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client as AwsS3SdkClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// An object as a UTF-8 string; a missing object is `ArchiveError::NotFound`.
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, ArchiveError>;
}

pub struct S3Archive {
    client: AwsS3SdkClient,
}

impl S3Archive {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArchiveStore for S3Archive {
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, ArchiveError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = format!("failed to get s3://{bucket}/{key}: {e}");
                match e.into_service_error() {
                    GetObjectError::NoSuchKey(_) => ArchiveError::NotFound(key.to_owned()),
                    _ => ArchiveError::OperationFailed(message),
                }
            })?;

        let body = output.body.collect().await.map_err(|e| {
            ArchiveError::OperationFailed(format!("failed to read s3://{bucket}/{key}: {e}"))
        })?;

        Ok(String::from_utf8(body.to_vec())?)
    }
}

/// Archive backed by a map of `bucket/key` to contents. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryArchive {
    inner: Arc<Mutex<MemoryArchiveInner>>,
}

#[derive(Default)]
struct MemoryArchiveInner {
    objects: HashMap<String, Result<String, ArchiveError>>,
    requested: Vec<String>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, bucket: &str, key: &str, body: impl Into<String>) -> Self {
        self.lock()
            .objects
            .insert(format!("{bucket}/{key}"), Ok(body.into()));
        self
    }

    /// Make reads of one object fail with `error`.
    pub fn with_error(self, bucket: &str, key: &str, error: ArchiveError) -> Self {
        self.lock()
            .objects
            .insert(format!("{bucket}/{key}"), Err(error));
        self
    }

    /// Keys requested so far, in request order.
    pub fn requested(&self) -> Vec<String> {
        self.lock().requested.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryArchiveInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchive {
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, ArchiveError> {
        let mut inner = self.lock();
        inner.requested.push(key.to_owned());
        match inner.objects.get(&format!("{bucket}/{key}")) {
            Some(response) => response.clone(),
            None => Err(ArchiveError::NotFound(key.to_owned())),
        }
    }
}

/// Key of the object holding the uploads of `device_id` received during `minute`.
pub fn object_key(country: &str, device_id: &str, minute: DateTime<Utc>) -> String {
    format!(
        "records/country_code={country}/device_id={device_id}/{}",
        minute.format("year=%Y/month=%m/day=%d/hour=%H/%M.jsonl")
    )
}

/// One accelerometer sample as published to the input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Seconds since the epoch.
    pub sample_t: f64,
}

/// One line of an archive object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArchiveRecord {
    pub device_id: String,
    /// Receive time, seconds since the epoch. The last sample was taken then.
    pub cloud_t: f64,
    /// Sampling rate in Hz.
    pub sr: f64,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl ArchiveRecord {
    /// Spread the burst back over time: the `i`-th of `n` samples was taken
    /// `(n - 1 - i) / sr` seconds before `cloud_t`.
    pub fn readings(&self) -> Result<Vec<Reading>, ArchiveError> {
        if !(self.sr.is_finite() && self.sr > 0.0) {
            return Err(ArchiveError::ParseError(format!(
                "sampling rate {} of device {} is not positive",
                self.sr, self.device_id
            )));
        }

        let n = self.x.len().min(self.y.len()).min(self.z.len());
        let readings = (0..n)
            .map(|i| Reading {
                device_id: self.device_id.clone(),
                x: self.x[i],
                y: self.y[i],
                z: self.z[i],
                sample_t: self.cloud_t - (n - 1 - i) as f64 / self.sr,
            })
            .collect();

        Ok(readings)
    }
}
