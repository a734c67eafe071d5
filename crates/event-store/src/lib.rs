//! Persistence log for workflow instances.
//!
//! Every state transition of an instance is appended to its own stream as an
//! [`EventEnvelope`]. Appends are version-checked so that two writers racing on
//! the same stream cannot both succeed, and any prefix of a stream can be
//! replayed to reconstruct the instance as it was at that point.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, TRIGGER_KEY, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{EventStore, EventStream, ExpectedVersion};
