use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{WaitRegistry, WaitToken};
use crate::error::{Result, SagaError};

const SELECT_COLUMNS: &str =
    "SELECT correlation_id, instance_id, step_name, expires_at, resume_schema_version FROM wait_tokens";

/// Wait registry backed by the `wait_tokens` table.
#[derive(Clone)]
pub struct PostgresWaitRegistry {
    pool: PgPool,
}

impl PostgresWaitRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_token(row: PgRow) -> Result<WaitToken> {
        Ok(WaitToken {
            correlation_id: CorrelationId::new(row.try_get::<String, _>("correlation_id")?),
            instance_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
            step_name: row.try_get("step_name")?,
            expires_at: row.try_get("expires_at")?,
            resume_schema_version: row.try_get("resume_schema_version")?,
        })
    }
}

#[async_trait]
impl WaitRegistry for PostgresWaitRegistry {
    async fn register(&self, token: WaitToken) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO wait_tokens (correlation_id, instance_id, step_name, expires_at, resume_schema_version)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (correlation_id) DO UPDATE
                SET step_name = EXCLUDED.step_name,
                    expires_at = EXCLUDED.expires_at,
                    resume_schema_version = EXCLUDED.resume_schema_version
                WHERE wait_tokens.instance_id = EXCLUDED.instance_id
            "#,
        )
        .bind(token.correlation_id.as_str())
        .bind(token.instance_id.as_uuid())
        .bind(&token.step_name)
        .bind(token.expires_at)
        .bind(token.resume_schema_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        // Zero rows means the id is held by another instance, unless that
        // token was taken between the two statements.
        if inserted == 0 {
            let owner: Option<Uuid> =
                sqlx::query_scalar("SELECT instance_id FROM wait_tokens WHERE correlation_id = $1")
                    .bind(token.correlation_id.as_str())
                    .fetch_optional(&self.pool)
                    .await?;
            if owner.is_some_and(|owner| owner != token.instance_id.as_uuid()) {
                return Err(SagaError::DuplicateCorrelation(token.correlation_id));
            }
        }
        Ok(())
    }

    async fn find(&self, correlation_id: &CorrelationId) -> Result<Option<WaitToken>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE correlation_id = $1"))
            .bind(correlation_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_token).transpose()
    }

    async fn take(&self, correlation_id: &CorrelationId) -> Result<Option<WaitToken>> {
        let row = sqlx::query(
            r#"
            DELETE FROM wait_tokens WHERE correlation_id = $1
            RETURNING correlation_id, instance_id, step_name, expires_at, resume_schema_version
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_token).transpose()
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WaitToken>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE expires_at <= $1 ORDER BY expires_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_token).collect()
    }

    async fn pending_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wait_tokens")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
