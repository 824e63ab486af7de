pub const RECORDS_RECEIVED: &str = "visit_pipeline_records_received_total";
pub const MALFORMED_RECORDS: &str = "visit_pipeline_malformed_records_total";
pub const SOURCE_ERRORS: &str = "visit_pipeline_source_errors_total";
pub const BATCH_SIZE: &str = "visit_pipeline_batch_size";

// Labelled with "sink"
pub const SINK_RECORDS_PROCESSED: &str = "visit_pipeline_sink_records_processed_total";
pub const SINK_RECORDS_SKIPPED: &str = "visit_pipeline_sink_records_skipped_total";
pub const SINK_ERRORS: &str = "visit_pipeline_sink_errors_total";
pub const SINK_FAILURES: &str = "visit_pipeline_sink_failures_total";
pub const SINK_RETRIES: &str = "visit_pipeline_sink_retries_total";
pub const SINK_RECORDS_DROPPED: &str = "visit_pipeline_sink_records_dropped_total";
pub const SINK_COMMIT_DURATION: &str = "visit_pipeline_sink_commit_duration_seconds";
pub const SINK_PENDING: &str = "visit_pipeline_sink_pending_entries";

pub const CHECKPOINT_COMMIT_DURATION: &str = "visit_pipeline_checkpoint_commit_duration_seconds";
pub const CHECKPOINT_FAILURES: &str = "visit_pipeline_checkpoint_failures_total";

pub const RECORDS_REPUBLISHED: &str = "visit_pipeline_records_republished_total";
pub const CAS_CONFLICTS: &str = "visit_pipeline_cas_conflicts_total";
pub const REPLAYED_RECORDS_IGNORED: &str = "visit_pipeline_replayed_records_ignored_total";

pub const LATE_RECORDS_DROPPED: &str = "visit_pipeline_late_records_total";
pub const WINDOWS_COMMITTED: &str = "visit_pipeline_windows_committed_total";
pub const WINDOWS_OPEN: &str = "visit_pipeline_windows_open";
pub const WATERMARK: &str = "visit_pipeline_watermark_ms";
