use async_trait::async_trait;
use eew_common::stream::{Cursor, LogError, LogService, StartPosition};
use tracing::info;

/// Where a consumer starts reading, and where it is told about progress.
///
/// Cursors are kept in memory only, so a restarted consumer starts from the
/// configured position again. A checkpointing implementation would persist
/// `advanced` cursors and hand the last one back from `initial_cursor`.
#[async_trait]
pub trait CursorSource: Send + Sync {
    async fn initial_cursor(
        &self,
        log: &dyn LogService,
        stream: &str,
    ) -> Result<Cursor, LogError>;

    /// Called after every read with the cursor the next read will use.
    async fn advanced(&self, _cursor: &Cursor) {}
}

/// First shard of the stream at a fixed start position.
#[derive(Debug, Clone, Copy)]
pub struct PositionCursorSource {
    position: StartPosition,
}

impl PositionCursorSource {
    pub fn new(position: StartPosition) -> Self {
        Self { position }
    }
}

#[async_trait]
impl CursorSource for PositionCursorSource {
    async fn initial_cursor(
        &self,
        log: &dyn LogService,
        stream: &str,
    ) -> Result<Cursor, LogError> {
        let shards = log.describe(stream).await?;
        let shard_id = shards
            .first()
            .ok_or_else(|| LogError::NoShards(stream.to_owned()))?;

        if shards.len() > 1 {
            info!(stream, shards = shards.len(), "stream has several shards, reading the first only");
        }

        let cursor = log.get_cursor(stream, shard_id, self.position).await?;
        info!(stream, shard_id = %shard_id, position = ?self.position, "cursor acquired");
        Ok(cursor)
    }
}
