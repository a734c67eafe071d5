use thiserror::Error;

use crate::{AggregateId, Version};

#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream moved since the writer last read it.
    #[error("stream {stream_id} is at version {actual}, writer expected {expected}")]
    VersionConflict {
        stream_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// The batch handed to `append` (or the envelope being built) is malformed.
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("entry encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true if this error is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::VersionConflict { .. })
    }

    /// Builds a conflict error and counts it.
    pub(crate) fn conflict(stream_id: AggregateId, expected: Version, actual: Version) -> Self {
        metrics::counter!("workflow_log_conflicts_total").increment(1);
        tracing::debug!(%stream_id, %expected, %actual, "append lost a version race");
        EventStoreError::VersionConflict {
            stream_id,
            expected,
            actual,
        }
    }
}

pub type Result<T> = std::result::Result<T, EventStoreError>;
