use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventStoreError, Result, Version,
    store::{EventStore, EventStream, ExpectedVersion, validate_batch},
};

const ENTRY_COLUMNS: &str =
    "id, event_type, aggregate_id, aggregate_type, version, timestamp, payload, metadata";

/// Log kept in the `events` table.
///
/// The `unique_aggregate_version` constraint settles races the version
/// check cannot see, such as two `ExpectedVersion::Any` writers.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the log, wait token and dedupe ledger tables.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn decode_row(row: PgRow) -> Result<EventEnvelope> {
        let metadata: serde_json::Value = row.try_get("metadata")?;
        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get("version")?),
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata: serde_json::from_value(metadata)?,
        })
    }

    async fn head(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        stream_id: AggregateId,
    ) -> Result<Version> {
        let head: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(stream_id.as_uuid())
                .fetch_one(&mut **tx)
                .await?;
        Ok(Version::new(head.unwrap_or(0)))
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(stream_id = tracing::field::Empty, count = events.len()))]
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        expected: ExpectedVersion,
    ) -> Result<Version> {
        validate_batch(&events)?;
        let stream_id = events[0].aggregate_id;
        tracing::Span::current().record("stream_id", tracing::field::display(stream_id));

        let mut tx = self.pool.begin().await?;
        if expected != ExpectedVersion::Any {
            let head = Self::head(&mut tx, stream_id).await?;
            if let Err(wanted) = expected.check(head) {
                return Err(EventStoreError::conflict(stream_id, wanted, head));
            }
        }

        let mut new_head = Version::initial();
        for event in &events {
            let inserted = sqlx::query(&format!(
                "INSERT INTO events ({ENTRY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            ))
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(stream_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(event.version.as_i64())
            .bind(event.timestamp)
            .bind(&event.payload)
            .bind(serde_json::to_value(&event.metadata)?)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => new_head = event.version,
                Err(sqlx::Error::Database(db))
                    if db.constraint() == Some("unique_aggregate_version") =>
                {
                    let previous = Version::new(event.version.as_i64() - 1);
                    return Err(EventStoreError::conflict(stream_id, previous, event.version));
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(new_head)
    }

    async fn read_stream(
        &self,
        stream_id: AggregateId,
        until: Option<Version>,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM events \
             WHERE aggregate_id = $1 AND ($2::BIGINT IS NULL OR version <= $2) \
             ORDER BY version ASC"
        ))
        .bind(stream_id.as_uuid())
        .bind(until.map(|v| v.as_i64()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::decode_row).collect()
    }

    async fn stream_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT aggregate_id FROM events \
             WHERE aggregate_type = $1 AND version = 1 \
             ORDER BY position ASC",
        )
        .bind(aggregate_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(AggregateId::from_uuid).collect())
    }

    async fn read_all(&self) -> Result<EventStream> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM events ORDER BY position ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        let entries: Vec<Result<EventEnvelope>> =
            rows.into_iter().map(Self::decode_row).collect();

        Ok(Box::pin(futures_util::stream::iter(entries)))
    }
}
