use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventStoreError, Result, Version,
    store::{EventStore, EventStream, ExpectedVersion, validate_batch},
};

/// Positions of one stream's entries in the global log.
struct StreamIndex {
    aggregate_type: String,
    positions: Vec<usize>,
}

impl StreamIndex {
    fn head(&self) -> Version {
        Version::new(self.positions.len() as i64)
    }
}

#[derive(Default)]
struct Log {
    entries: Vec<EventEnvelope>,
    streams: HashMap<AggregateId, StreamIndex>,
    opened: Vec<AggregateId>,
}

/// Process-local log with the same append rules as [`crate::PostgresEventStore`].
///
/// Clones share the log, so an engine rebuilt over a clone after a simulated
/// crash sees everything the previous one wrote.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all streams.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.entries.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        expected: ExpectedVersion,
    ) -> Result<Version> {
        validate_batch(&events)?;
        let stream_id = events[0].aggregate_id;

        let mut log = self.log.write().await;
        let head = log
            .streams
            .get(&stream_id)
            .map(StreamIndex::head)
            .unwrap_or_default();

        if let Err(wanted) = expected.check(head) {
            return Err(EventStoreError::conflict(stream_id, wanted, head));
        }
        // Mirrors the (aggregate_id, version) unique constraint.
        if events[0].version != head.next() {
            return Err(EventStoreError::conflict(
                stream_id,
                Version::new(events[0].version.as_i64() - 1),
                head,
            ));
        }

        let start = log.entries.len();
        let new_head = Version::new(head.as_i64() + events.len() as i64);
        if head == Version::initial() {
            log.opened.push(stream_id);
            log.streams.insert(
                stream_id,
                StreamIndex {
                    aggregate_type: events[0].aggregate_type.clone(),
                    positions: Vec::new(),
                },
            );
        }
        if let Some(index) = log.streams.get_mut(&stream_id) {
            index.positions.extend(start..start + events.len());
        }
        log.entries.extend(events);

        Ok(new_head)
    }

    async fn read_stream(
        &self,
        stream_id: AggregateId,
        until: Option<Version>,
    ) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        let Some(index) = log.streams.get(&stream_id) else {
            return Ok(Vec::new());
        };
        let take = until.map_or(index.positions.len(), |v| {
            (v.as_i64().max(0) as usize).min(index.positions.len())
        });
        Ok(index.positions[..take]
            .iter()
            .map(|&at| log.entries[at].clone())
            .collect())
    }

    async fn stream_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>> {
        let log = self.log.read().await;
        Ok(log
            .opened
            .iter()
            .filter(|id| {
                log.streams
                    .get(id)
                    .is_some_and(|s| s.aggregate_type == aggregate_type)
            })
            .copied()
            .collect())
    }

    async fn read_all(&self) -> Result<EventStream> {
        let entries = self.log.read().await.entries.clone();
        Ok(Box::pin(futures_util::stream::iter(
            entries.into_iter().map(Ok),
        )))
    }
}
