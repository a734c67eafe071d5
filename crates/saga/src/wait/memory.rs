use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::CorrelationId;
use tokio::sync::RwLock;

use super::{WaitRegistry, WaitToken};
use crate::error::{Result, SagaError};

/// In-memory wait registry with the same semantics as the PostgreSQL table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWaitRegistry {
    tokens: Arc<RwLock<HashMap<CorrelationId, WaitToken>>>,
}

impl InMemoryWaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaitRegistry for InMemoryWaitRegistry {
    async fn register(&self, token: WaitToken) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        if tokens
            .get(&token.correlation_id)
            .is_some_and(|existing| existing.instance_id != token.instance_id)
        {
            return Err(SagaError::DuplicateCorrelation(token.correlation_id));
        }
        tokens.insert(token.correlation_id.clone(), token);
        Ok(())
    }

    async fn find(&self, correlation_id: &CorrelationId) -> Result<Option<WaitToken>> {
        Ok(self.tokens.read().await.get(correlation_id).cloned())
    }

    async fn take(&self, correlation_id: &CorrelationId) -> Result<Option<WaitToken>> {
        Ok(self.tokens.write().await.remove(correlation_id))
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WaitToken>> {
        let tokens = self.tokens.read().await;
        let mut due: Vec<WaitToken> = tokens
            .values()
            .filter(|t| t.is_expired(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.expires_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.tokens.read().await.len())
    }
}
