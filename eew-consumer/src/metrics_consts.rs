pub const POLL_TICKS: &str = "eew_consumer_poll_ticks";
pub const READS_DEFERRED: &str = "eew_consumer_reads_deferred";
pub const RECORDS_READ: &str = "eew_consumer_records_read";
pub const READ_ERRORS: &str = "eew_consumer_read_errors";
pub const MILLIS_BEHIND_LATEST: &str = "eew_consumer_millis_behind_latest";
pub const DECODE_ERRORS: &str = "eew_consumer_decode_errors";
pub const ROWS_WRITTEN: &str = "eew_consumer_rows_written";
pub const SINK_WRITE_ERRORS: &str = "eew_consumer_sink_write_errors";
pub const SINK_WRITE_TIME: &str = "eew_consumer_sink_write_time_seconds";
pub const DUPLICATES_IN_BATCH: &str = "eew_consumer_duplicates_in_batch";
pub const ALERTS_SUPPRESSED: &str = "eew_consumer_alerts_suppressed";
pub const ALERT_RECOVERIES: &str = "eew_consumer_alert_recoveries";
pub const NOTIFICATIONS_SENT: &str = "eew_consumer_notifications_sent";
pub const NOTIFICATION_ERRORS: &str = "eew_consumer_notification_errors";
pub const SUBSCRIBERS_REGISTERED: &str = "eew_consumer_subscribers_registered";
