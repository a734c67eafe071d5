use common::AggregateId;
use event_store::{EventStoreError, Version};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("reading the log failed: {0}")]
    EventStore(#[from] EventStoreError),

    /// A workflow entry whose payload is not a known `WorkflowEvent`.
    #[error("cannot decode entry {version} of instance {instance_id}: {source}")]
    Decode {
        instance_id: AggregateId,
        version: Version,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
