//! Engine error types.

use common::{AggregateId, CorrelationId};
use domain::DomainError;
use event_store::{EventStoreError, Version};
use thiserror::Error;

use crate::state::InstanceStatus;

/// Errors returned by engine operations.
///
/// The first group are protocol errors: the request is rejected and the
/// instance is left unchanged.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No open wait token matches the correlation id.
    #[error("Unknown correlation id: {0}")]
    UnknownCorrelation(CorrelationId),

    /// The wait token exists but its deadline has passed.
    #[error("Wait token expired for correlation id: {0}")]
    ExpiredToken(CorrelationId),

    /// Another writer advanced the instance first.
    #[error("Stale version for instance {instance_id}: expected {expected}, found {actual}")]
    StaleVersion {
        instance_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// The instance is not in a state that allows the operation.
    #[error("Cannot {operation} instance {instance_id} in status {status}")]
    InvalidState {
        instance_id: AggregateId,
        status: InstanceStatus,
        operation: &'static str,
    },

    /// No definition is registered under the id (and version).
    #[error("Unknown workflow definition: {0}")]
    UnknownDefinition(String),

    /// No instance exists with the id.
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(AggregateId),

    /// A definition was rejected at registration.
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A correlation id is already parked for a different instance.
    #[error("Correlation id {0} is already registered")]
    DuplicateCorrelation(CorrelationId),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(DomainError),

    /// Event store error.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Wait registry or dedupe ledger database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DomainError> for SagaError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::EventStore(EventStoreError::VersionConflict {
                stream_id,
                expected,
                actual,
            }) => SagaError::StaleVersion {
                instance_id: stream_id,
                expected,
                actual,
            },
            other => SagaError::Domain(other),
        }
    }
}

impl SagaError {
    /// Returns true if the write lost an optimistic-concurrency race.
    pub fn is_stale(&self) -> bool {
        matches!(self, SagaError::StaleVersion { .. })
    }

    /// Stable machine-readable code for callers.
    pub fn code(&self) -> &'static str {
        match self {
            SagaError::UnknownCorrelation(_) => "UNKNOWN_CORRELATION",
            SagaError::ExpiredToken(_) => "EXPIRED_TOKEN",
            SagaError::StaleVersion { .. } => "STALE_VERSION",
            SagaError::InvalidState { .. } => "INVALID_STATE",
            SagaError::UnknownDefinition(_) => "UNKNOWN_DEFINITION",
            SagaError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            SagaError::InvalidDefinition(_) => "INVALID_DEFINITION",
            SagaError::DuplicateCorrelation(_) => "DUPLICATE_CORRELATION",
            SagaError::Domain(_)
            | SagaError::EventStore(_)
            | SagaError::Database(_)
            | SagaError::Serialization(_) => "INTERNAL",
        }
    }
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, SagaError>;
