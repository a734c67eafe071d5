use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{AggregateId, EventEnvelope, EventStoreError, Result, Version};

/// Version a writer expects the stream to be at before its batch lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedVersion {
    /// Only the per-stream version uniqueness is enforced.
    #[default]
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream head must be exactly this version.
    Exactly(Version),
}

impl ExpectedVersion {
    /// Checks `head` against the expectation, returning the version that
    /// was required when it does not hold.
    pub fn check(self, head: Version) -> std::result::Result<(), Version> {
        match self {
            ExpectedVersion::Any => Ok(()),
            ExpectedVersion::NoStream if head == Version::initial() => Ok(()),
            ExpectedVersion::NoStream => Err(Version::initial()),
            ExpectedVersion::Exactly(v) if v == head => Ok(()),
            ExpectedVersion::Exactly(v) => Err(v),
        }
    }
}

impl From<Version> for ExpectedVersion {
    fn from(version: Version) -> Self {
        ExpectedVersion::Exactly(version)
    }
}

/// Entries of the global log in insertion order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Append-only log holding one stream per workflow instance.
///
/// Implementations are shared by every engine task, so they must be
/// thread-safe. Two appends that both target version `n + 1` of a stream can
/// never both succeed, whatever `ExpectedVersion` they carry.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch to one stream atomically and returns the new head.
    async fn append(&self, events: Vec<EventEnvelope>, expected: ExpectedVersion)
    -> Result<Version>;

    /// Reads a stream in version order. With `until`, stops after that
    /// version, which is what point-in-time replay needs.
    async fn read_stream(
        &self,
        stream_id: AggregateId,
        until: Option<Version>,
    ) -> Result<Vec<EventEnvelope>>;

    /// Ids of every stream of `aggregate_type`, in the order they were opened.
    async fn stream_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>>;

    /// Every entry of every stream, in insertion order.
    async fn read_all(&self) -> Result<EventStream>;
}

/// Checks that a batch is non-empty, targets a single stream and carries
/// consecutive versions.
pub fn validate_batch(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::MalformedBatch("batch is empty".to_string()));
    };

    let mut want = first.version;
    for event in &events[1..] {
        if event.aggregate_id != first.aggregate_id || event.aggregate_type != first.aggregate_type
        {
            return Err(EventStoreError::MalformedBatch(format!(
                "batch for stream {} also carries stream {}",
                first.aggregate_id, event.aggregate_id
            )));
        }
        want = want.next();
        if event.version != want {
            return Err(EventStoreError::MalformedBatch(format!(
                "version {} follows {}, expected {want}",
                event.version,
                want.as_i64() - 1
            )));
        }
    }

    Ok(())
}
