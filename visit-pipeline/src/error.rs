use rdkafka::error::KafkaError;
use thiserror::Error;

/// A source record that cannot be turned into a `VisitEvent`. Dropped and counted.
#[derive(Error, Debug)]
pub enum MalformedRecordError {
    #[error("record has no payload")]
    EmptyPayload,
    #[error("payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("failed to parse record: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("record is missing the {0} field")]
    MissingField(&'static str),
    #[error("{0} is not a valid last_action")]
    UnknownAction(String),
    #[error("{0} is not a valid visit_date")]
    InvalidTimestamp(String),
    #[error("duration must be a non-negative number of seconds, got {0}")]
    InvalidDuration(i64),
}

impl MalformedRecordError {
    /// Short label used for the malformed records counter.
    pub fn reason(&self) -> &'static str {
        match self {
            MalformedRecordError::EmptyPayload => "empty_payload",
            MalformedRecordError::Encoding(_) => "invalid_encoding",
            MalformedRecordError::Parse(_) => "parse_error",
            MalformedRecordError::MissingField(_) => "missing_field",
            MalformedRecordError::UnknownAction(_) => "unknown_action",
            MalformedRecordError::InvalidTimestamp(_) => "invalid_timestamp",
            MalformedRecordError::InvalidDuration(_) => "invalid_duration",
        }
    }
}

/// Errors raised by the external stores the sinks write to.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("message rejected by the broker: {0}")]
    Rejected(KafkaError),
    #[error("delivery was canceled before an ack was received")]
    Canceled,
    #[error("stored value is not valid: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Rejections and corrupt values won't get better by trying again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StoreError::Rejected(_) | StoreError::Corrupt(_) | StoreError::Migration(_)
        )
    }
}

/// Errors surfaced by a sink processor. None of these halt the pipeline,
/// `Overflow` stops the processor that raised it.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{sink} unavailable after {attempts} attempts: {source}")]
    Unavailable {
        sink: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("{sink} dropped {dropped} records after exhausting retries")]
    Dropped { sink: &'static str, dropped: usize },
    #[error("failed to serialize for {sink}: {source}")]
    Serialization {
        sink: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("compare-and-set on {key} conflicted {attempts} times in a row")]
    CasExhausted { key: String, attempts: u32 },
    #[error("{sink} holds back {pending} entries, more than the limit of {limit}")]
    Overflow {
        sink: &'static str,
        pending: usize,
        limit: usize,
    },
    #[error("checkpointed state for {sink} cannot be restored: {source}")]
    InvalidState {
        sink: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the checkpoint store. `Medium` is fatal for the pipeline.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint medium unavailable for {processor}: {source}")]
    Medium {
        processor: String,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint for {processor} is corrupt: {source}")]
    Corrupt {
        processor: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "checkpoint for {processor} would move partition {partition} back from {current} to {proposed}"
    )]
    Regression {
        processor: String,
        partition: i32,
        current: i64,
        proposed: i64,
    },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("topic {0} has no partitions")]
    NoPartitions(String),
}

/// Top level errors, any of these stops the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("halting on checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("event source failed: {0}")]
    Source(#[from] SourceError),
    #[error("sink {0} could not be restored: {1}")]
    Restore(&'static str, #[source] SinkError),
    #[error("processors did not drain within {0:?}")]
    ShutdownTimeout(std::time::Duration),
}
