use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Cursor, LogError, LogRecord, LogService, ReadBatch, StartPosition};

/// In-memory log with Kinesis-like semantics: records are routed to a shard by
/// a hash of their partition key, cursors are `<shard>:<offset>` tokens, and
/// reads never block.
///
/// Clones share state, so a test can keep a handle while the engine owns another.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<Vec<LogRecord>>>,
    next_sequence: u64,
    read_failures: VecDeque<LogError>,
    append_failures: VecDeque<LogError>,
    reads: Vec<Cursor>,
    appended_batches: Vec<usize>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a stream with `shard_count` empty shards.
    pub fn with_stream(self, stream: &str, shard_count: usize) -> Self {
        self.lock()
            .streams
            .insert(stream.to_owned(), vec![Vec::new(); shard_count]);
        self
    }

    /// The next `read` calls fail with these errors, in order.
    pub fn fail_next_reads(&self, errors: impl IntoIterator<Item = LogError>) {
        self.lock().read_failures.extend(errors);
    }

    /// The next `append`/`append_batch` calls fail with these errors, in order.
    pub fn fail_next_appends(&self, errors: impl IntoIterator<Item = LogError>) {
        self.lock().append_failures.extend(errors);
    }

    /// Every cursor passed to `read`, including calls that failed.
    pub fn reads(&self) -> Vec<Cursor> {
        self.lock().reads.clone()
    }

    /// Size of each successful `append_batch` call, in call order.
    pub fn appended_batches(&self) -> Vec<usize> {
        self.lock().appended_batches.clone()
    }

    /// All records of a stream, shard by shard.
    pub fn records(&self, stream: &str) -> Vec<LogRecord> {
        self.lock()
            .streams
            .get(stream)
            .map(|shards| shards.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the log from the others.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn shard_id(index: usize) -> String {
    format!("shardId-{index:012}")
}

fn shard_index(shard_id: &str) -> Option<usize> {
    shard_id.strip_prefix("shardId-")?.parse().ok()
}

fn shard_for_key(partition_key: &str, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    partition_key.hash(&mut hasher);
    usize::try_from(hasher.finish() % shard_count.max(1) as u64).unwrap_or(0)
}

impl Inner {
    fn push(&mut self, stream: &str, mut record: LogRecord) -> Result<(), LogError> {
        let sequence = self.next_sequence;
        let shards = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_owned()))?;
        if shards.is_empty() {
            return Err(LogError::NoShards(stream.to_owned()));
        }

        let shard = shard_for_key(&record.partition_key, shards.len());
        record.sequence_number = Some(format!("{sequence:020}"));
        shards[shard].push(record);
        self.next_sequence += 1;
        Ok(())
    }
}

#[async_trait]
impl LogService for MemoryLog {
    async fn describe(&self, stream: &str) -> Result<Vec<String>, LogError> {
        let inner = self.lock();
        let shards = inner
            .streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_owned()))?;
        if shards.is_empty() {
            return Err(LogError::NoShards(stream.to_owned()));
        }
        Ok((0..shards.len()).map(shard_id).collect())
    }

    async fn get_cursor(
        &self,
        stream: &str,
        shard_id: &str,
        position: StartPosition,
    ) -> Result<Cursor, LogError> {
        let inner = self.lock();
        let shards = inner
            .streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_owned()))?;
        let shard = shard_index(shard_id)
            .and_then(|index| shards.get(index))
            .ok_or_else(|| LogError::StreamNotFound(format!("{stream}/{shard_id}")))?;

        let offset = match position {
            StartPosition::Latest => shard.len(),
            StartPosition::TrimHorizon => 0,
        };

        Ok(Cursor {
            stream_id: stream.to_owned(),
            shard_id: shard_id.to_owned(),
            token: format!("{shard_id}:{offset}"),
        })
    }

    async fn read(&self, cursor: &Cursor, limit: usize) -> Result<ReadBatch, LogError> {
        let mut inner = self.lock();
        inner.reads.push(cursor.clone());

        if let Some(error) = inner.read_failures.pop_front() {
            return Err(error);
        }

        let offset: usize = cursor
            .token
            .rsplit_once(':')
            .and_then(|(_, offset)| offset.parse().ok())
            .ok_or_else(|| LogError::ExpiredCursor(cursor.token.clone()))?;

        let shard = inner
            .streams
            .get(&cursor.stream_id)
            .and_then(|shards| shards.get(shard_index(&cursor.shard_id)?))
            .ok_or_else(|| LogError::StreamNotFound(cursor.stream_id.clone()))?;

        let end = shard.len().min(offset.saturating_add(limit));
        let records: Vec<LogRecord> = shard.get(offset..end).unwrap_or_default().to_vec();
        let behind = shard.len().saturating_sub(end);
        let next_offset = offset + records.len();

        Ok(ReadBatch {
            records,
            next_cursor: Some(Cursor {
                stream_id: cursor.stream_id.clone(),
                shard_id: cursor.shard_id.clone(),
                token: format!("{}:{next_offset}", cursor.shard_id),
            }),
            millis_behind_latest: Some(if behind == 0 { 0 } else { 1000 }),
        })
    }

    async fn append(&self, stream: &str, record: LogRecord) -> Result<(), LogError> {
        let mut inner = self.lock();
        if let Some(error) = inner.append_failures.pop_front() {
            return Err(error);
        }
        inner.push(stream, record)
    }

    async fn append_batch(&self, stream: &str, records: Vec<LogRecord>) -> Result<(), LogError> {
        let mut inner = self.lock();
        if let Some(error) = inner.append_failures.pop_front() {
            return Err(error);
        }

        let count = records.len();
        for record in records {
            inner.push(stream, record)?;
        }
        inner.appended_batches.push(count);
        Ok(())
    }
}
