use event_store::EventStoreError;
use thiserror::Error;

/// Failure to load or persist a stream-backed aggregate.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// A stored payload no longer decodes into the aggregate's event type,
    /// or a new event failed to encode.
    #[error("event payload codec error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Returns true if the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_conflict())
    }
}
