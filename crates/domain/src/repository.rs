//! Loading and persisting event-sourced aggregates.

use std::collections::HashMap;
use std::marker::PhantomData;

use common::AggregateId;
use event_store::{EventEnvelope, EventStore, ExpectedVersion, Version};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::DomainError;

/// Metadata attached to every envelope of one append (e.g. the trigger).
pub type EventMetadata = HashMap<String, serde_json::Value>;

/// Rebuilds aggregates from their streams and appends new events with
/// optimistic concurrency.
///
/// Every write is checked against the version the caller last saw, so two
/// writers that loaded the same version cannot both commit.
pub struct AggregateRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> Clone for AggregateRepository<S, A>
where
    S: EventStore + Clone,
    A: Aggregate,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<S, A> AggregateRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    /// Creates a new repository over the given event store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads the current state of an aggregate, or None if its stream is empty.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let events = self.store.read_stream(aggregate_id, None).await?;
        Self::replay(events)
    }

    /// Loads an aggregate exactly as it was after `version` was written.
    pub async fn load_at(
        &self,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Result<Option<A>, DomainError> {
        let events = self.store.read_stream(aggregate_id, Some(version)).await?;
        Self::replay(events)
    }

    fn replay(events: Vec<EventEnvelope>) -> Result<Option<A>, DomainError> {
        if events.is_empty() {
            return Ok(None);
        }

        let mut aggregate = A::default();
        for envelope in events {
            let event: A::Event = serde_json::from_value(envelope.payload)?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
        }
        Ok(Some(aggregate))
    }

    /// Appends events on top of `aggregate` and applies them in place.
    ///
    /// The append is rejected with a concurrency conflict when the stream has
    /// moved past `aggregate.version()`; the aggregate is left untouched.
    pub async fn commit(
        &self,
        aggregate_id: AggregateId,
        aggregate: &mut A,
        events: Vec<A::Event>,
        metadata: &EventMetadata,
    ) -> Result<Version, DomainError> {
        let current_version = aggregate.version();
        if events.is_empty() {
            return Ok(current_version);
        }

        let envelopes = Self::build_envelopes(aggregate_id, current_version, &events, metadata)?;
        let new_version = self
            .store
            .append(envelopes, ExpectedVersion::Exactly(current_version))
            .await?;

        aggregate.apply_events(events);
        aggregate.set_version(new_version);
        Ok(new_version)
    }

    /// Builds event envelopes from domain events.
    fn build_envelopes(
        aggregate_id: AggregateId,
        current_version: Version,
        events: &[A::Event],
        metadata: &EventMetadata,
    ) -> Result<Vec<EventEnvelope>, DomainError> {
        let mut envelopes = Vec::with_capacity(events.len());
        let mut version = current_version;

        for event in events {
            version = version.next();
            let envelope = EventEnvelope::builder()
                .aggregate_id(aggregate_id)
                .aggregate_type(A::aggregate_type())
                .event_type(event.event_type())
                .version(version)
                .payload(event)?
                .metadata_map(metadata)
                .build()?;
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }
}
