//! Traits for state rebuilt from an append-only stream.

use common::AggregateId;
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// A fact recorded in a stream. Named in the past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Stable name written to the envelope's `event_type` column.
    fn event_type(&self) -> &'static str;
}

/// State that exists only as the fold of its stream.
///
/// `apply` is pure and infallible, so replaying any prefix of a stream gives
/// the state exactly as it stood when that prefix was the whole stream.
/// Deciding what to append is left to the owner of the state; an aggregate
/// only knows how to absorb what was already decided.
pub trait Aggregate: Default + Send + Sync + Sized {
    type Event: DomainEvent;

    /// Stream kind, stored next to every entry of the stream.
    fn aggregate_type() -> &'static str;

    /// None until the opening event has been applied.
    fn id(&self) -> Option<AggregateId>;

    /// Version of the last applied entry; 0 before any.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    fn apply(&mut self, event: Self::Event);

    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}
