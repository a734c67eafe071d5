//! Projection trait and the decoded log entries projections consume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::Aggregate;
use event_store::{EventEnvelope, Version};
use saga::{WorkflowEvent, WorkflowInstance};

use crate::error::{ProjectionError, Result};

/// One entry of a workflow instance stream, decoded once by the processor.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub instance_id: AggregateId,
    pub version: Version,
    pub recorded_at: DateTime<Utc>,
    pub event: WorkflowEvent,
}

impl InstanceEvent {
    /// Decodes an envelope. Entries of other streams yield `None`.
    pub fn decode(envelope: &EventEnvelope) -> Result<Option<Self>> {
        if envelope.aggregate_type != WorkflowInstance::aggregate_type() {
            return Ok(None);
        }
        let event = serde_json::from_value(envelope.payload.clone()).map_err(|source| {
            ProjectionError::Decode {
                instance_id: envelope.aggregate_id,
                version: envelope.version,
                source,
            }
        })?;
        Ok(Some(Self {
            instance_id: envelope.aggregate_id,
            version: envelope.version,
            recorded_at: envelope.timestamp,
            event,
        }))
    }
}

/// Offset into the global log: the number of entries a projection has
/// already been offered, whether or not they were workflow entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(u64);

impl Checkpoint {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn offset(&self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A read model fed from the workflow instance log.
///
/// `apply` must tolerate events for instances it never saw start; the
/// processor does not filter by instance.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, event: &InstanceEvent) -> Result<()>;

    /// Drops all state so the log can be replayed from the start.
    async fn reset(&self) -> Result<()>;
}
