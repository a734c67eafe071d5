//! Wait registry: instances parked on an external callback.

mod memory;
mod postgres;

pub use memory::InMemoryWaitRegistry;
pub use postgres::PostgresWaitRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use serde::{Deserialize, Serialize};

use crate::aggregate::ParkedWait;
use crate::error::Result;

/// Durable record of an instance parked on `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitToken {
    pub correlation_id: CorrelationId,
    pub instance_id: AggregateId,
    pub step_name: String,
    pub expires_at: DateTime<Utc>,
    pub resume_schema_version: i32,
}

impl WaitToken {
    /// Rebuilds the token from the parked state recorded in the log.
    pub fn from_parked(instance_id: AggregateId, wait: &ParkedWait) -> Self {
        Self {
            correlation_id: wait.correlation_id.clone(),
            instance_id,
            step_name: wait.step_name.clone(),
            expires_at: wait.expires_at,
            resume_schema_version: wait.resume_schema_version,
        }
    }

    /// A token is due from its deadline onwards; resume and the sweeper both
    /// use this boundary.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage for wait tokens, unique by correlation id.
///
/// `take` is the only way a token is consumed: it deletes and returns the row
/// atomically, so of two racing consumers at most one gets it.
#[async_trait]
pub trait WaitRegistry: Send + Sync {
    /// Stores a token. Re-registering for the same instance replaces the
    /// deadline, step and schema version with the new ones; a correlation id
    /// held by another instance is rejected with `DuplicateCorrelation`.
    async fn register(&self, token: WaitToken) -> Result<()>;

    /// Looks up a token without consuming it.
    async fn find(&self, correlation_id: &CorrelationId) -> Result<Option<WaitToken>>;

    /// Deletes and returns a token.
    async fn take(&self, correlation_id: &CorrelationId) -> Result<Option<WaitToken>>;

    /// Tokens that are expired at `now`, earliest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WaitToken>>;

    /// Number of open tokens.
    async fn pending_count(&self) -> Result<usize>;
}
