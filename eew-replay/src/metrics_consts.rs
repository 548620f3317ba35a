pub const ARCHIVE_OBJECTS_READ: &str = "eew_replay_archive_objects_read";
pub const ARCHIVE_OBJECTS_MISSING: &str = "eew_replay_archive_objects_missing";
pub const ARCHIVE_LINES_SKIPPED: &str = "eew_replay_archive_lines_skipped";
pub const READINGS_EMITTED: &str = "eew_replay_readings_emitted";
pub const BATCHES_FLUSHED: &str = "eew_replay_batches_flushed";
pub const BATCH_FLUSH_ERRORS: &str = "eew_replay_batch_flush_errors";
pub const BATCH_FLUSH_TIME: &str = "eew_replay_batch_flush_time_seconds";
pub const WINDOWS_REPLAYED: &str = "eew_replay_windows_replayed";
pub const WINDOW_ERRORS: &str = "eew_replay_window_errors";
