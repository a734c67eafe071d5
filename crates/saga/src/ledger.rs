//! Dedupe ledger for steps that cannot deduplicate on their own.
//!
//! The executor records a `RequiresDedupe` step's result under its idempotency
//! key before writing the success to the log. On a re-drive, a ledger hit means
//! the external effect already happened and its result is reused; a miss after a
//! dangling attempt means nobody knows, and the step is escalated instead of
//! being called again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, IdempotencyKey};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::step::ContextMap;

#[async_trait]
pub trait DedupeLedger: Send + Sync {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<ContextMap>>;

    /// Records a result. The first write for a key wins.
    async fn record(
        &self,
        key: &IdempotencyKey,
        instance_id: AggregateId,
        step_name: &str,
        result: &ContextMap,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDedupeLedger {
    entries: Arc<RwLock<HashMap<IdempotencyKey, ContextMap>>>,
}

impl InMemoryDedupeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DedupeLedger for InMemoryDedupeLedger {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<ContextMap>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn record(
        &self,
        key: &IdempotencyKey,
        _instance_id: AggregateId,
        _step_name: &str,
        result: &ContextMap,
    ) -> Result<()> {
        self.entries
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| result.clone());
        Ok(())
    }
}

/// Ledger backed by the `dedupe_ledger` table.
#[derive(Clone)]
pub struct PostgresDedupeLedger {
    pool: PgPool,
}

impl PostgresDedupeLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupeLedger for PostgresDedupeLedger {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<ContextMap>> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT result FROM dedupe_ledger WHERE idempotency_key = $1")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    async fn record(
        &self,
        key: &IdempotencyKey,
        instance_id: AggregateId,
        step_name: &str,
        result: &ContextMap,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dedupe_ledger (idempotency_key, instance_id, step_name, result)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(instance_id.as_uuid())
        .bind(step_name)
        .bind(serde_json::Value::Object(result.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
