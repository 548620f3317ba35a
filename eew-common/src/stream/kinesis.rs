use async_trait::async_trait;
use aws_sdk_kinesis::error::{DisplayErrorContext, SdkError};
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::{PutRecordsRequestEntry, ShardIteratorType};
use aws_sdk_kinesis::Client;
use tracing::debug;

use super::{Cursor, LogError, LogRecord, LogService, ReadBatch, StartPosition};

#[derive(Clone)]
pub struct KinesisLog {
    client: Client,
}

impl KinesisLog {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Transport failures, timeouts and unmodelled service errors all end up here.
fn unavailable<E, R>(error: SdkError<E, R>) -> LogError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    LogError::Unavailable(DisplayErrorContext(&error).to_string())
}

fn iterator_type(position: StartPosition) -> ShardIteratorType {
    match position {
        StartPosition::Latest => ShardIteratorType::Latest,
        StartPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
    }
}

#[async_trait]
impl LogService for KinesisLog {
    async fn describe(&self, stream: &str) -> Result<Vec<String>, LogError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // The stream name must not be sent together with a pagination token.
            let request = match &next_token {
                Some(token) => self.client.list_shards().next_token(token),
                None => self.client.list_shards().stream_name(stream),
            };

            let output = request.send().await.map_err(|error| {
                match error.as_service_error() {
                    Some(service) if service.is_resource_not_found_exception() => {
                        LogError::StreamNotFound(stream.to_owned())
                    }
                    Some(service) if service.is_limit_exceeded_exception() => {
                        LogError::Throttled(stream.to_owned())
                    }
                    _ => unavailable(error),
                }
            })?;

            shards.extend(output.shards().iter().map(|shard| shard.shard_id().to_owned()));

            match output.next_token() {
                Some(token) => next_token = Some(token.to_owned()),
                None => break,
            }
        }

        debug!(stream, shards = shards.len(), "described stream");

        if shards.is_empty() {
            return Err(LogError::NoShards(stream.to_owned()));
        }

        Ok(shards)
    }

    async fn get_cursor(
        &self,
        stream: &str,
        shard_id: &str,
        position: StartPosition,
    ) -> Result<Cursor, LogError> {
        let output = self
            .client
            .get_shard_iterator()
            .stream_name(stream)
            .shard_id(shard_id)
            .shard_iterator_type(iterator_type(position))
            .send()
            .await
            .map_err(|error| match error.as_service_error() {
                Some(service) if service.is_resource_not_found_exception() => {
                    LogError::StreamNotFound(stream.to_owned())
                }
                Some(service) if service.is_provisioned_throughput_exceeded_exception() => {
                    LogError::Throttled(shard_id.to_owned())
                }
                _ => unavailable(error),
            })?;

        let token = output.shard_iterator().ok_or_else(|| {
            LogError::Unavailable(format!("no shard iterator returned for {stream}/{shard_id}"))
        })?;

        Ok(Cursor {
            stream_id: stream.to_owned(),
            shard_id: shard_id.to_owned(),
            token: token.to_owned(),
        })
    }

    async fn read(&self, cursor: &Cursor, limit: usize) -> Result<ReadBatch, LogError> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);

        let output = self
            .client
            .get_records()
            .shard_iterator(&cursor.token)
            .limit(limit)
            .send()
            .await
            .map_err(|error| match error.as_service_error() {
                Some(service)
                    if service.is_provisioned_throughput_exceeded_exception()
                        || service.is_kms_throttling_exception() =>
                {
                    LogError::Throttled(cursor.shard_id.clone())
                }
                Some(service) if service.is_expired_iterator_exception() => {
                    LogError::ExpiredCursor(cursor.shard_id.clone())
                }
                Some(service) if service.is_resource_not_found_exception() => {
                    LogError::StreamNotFound(cursor.stream_id.clone())
                }
                _ => unavailable(error),
            })?;

        let records = output
            .records()
            .iter()
            .map(|record| LogRecord {
                payload: record.data().as_ref().to_vec(),
                partition_key: record.partition_key().to_owned(),
                sequence_number: Some(record.sequence_number().to_owned()),
            })
            .collect();

        let next_cursor = output.next_shard_iterator().map(|token| Cursor {
            stream_id: cursor.stream_id.clone(),
            shard_id: cursor.shard_id.clone(),
            token: token.to_owned(),
        });

        Ok(ReadBatch {
            records,
            next_cursor,
            millis_behind_latest: output.millis_behind_latest(),
        })
    }

    async fn append(&self, stream: &str, record: LogRecord) -> Result<(), LogError> {
        self.client
            .put_record()
            .stream_name(stream)
            .partition_key(record.partition_key)
            .data(Blob::new(record.payload))
            .send()
            .await
            .map_err(|error| match error.as_service_error() {
                Some(service) if service.is_resource_not_found_exception() => {
                    LogError::StreamNotFound(stream.to_owned())
                }
                Some(service) if service.is_provisioned_throughput_exceeded_exception() => {
                    LogError::Throttled(stream.to_owned())
                }
                _ => unavailable(error),
            })?;

        Ok(())
    }

    async fn append_batch(&self, stream: &str, records: Vec<LogRecord>) -> Result<(), LogError> {
        if records.is_empty() {
            return Ok(());
        }

        let total = records.len();
        let entries = records
            .into_iter()
            .map(|record| {
                PutRecordsRequestEntry::builder()
                    .data(Blob::new(record.payload))
                    .partition_key(record.partition_key)
                    .build()
                    .map_err(|error| LogError::InvalidRecord(error.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .put_records()
            .stream_name(stream)
            .set_records(Some(entries))
            .send()
            .await
            .map_err(|error| match error.as_service_error() {
                Some(service) if service.is_resource_not_found_exception() => {
                    LogError::StreamNotFound(stream.to_owned())
                }
                Some(service) if service.is_provisioned_throughput_exceeded_exception() => {
                    LogError::Throttled(stream.to_owned())
                }
                _ => unavailable(error),
            })?;

        // PutRecords is not atomic: individual entries can fail while the call succeeds.
        let failed = output.failed_record_count().unwrap_or(0);
        if failed > 0 {
            return Err(LogError::PartialAppend {
                failed: usize::try_from(failed).unwrap_or(total),
                total,
            });
        }

        Ok(())
    }
}
