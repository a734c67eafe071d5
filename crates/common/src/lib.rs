//! Identifier types shared by the log, the engine and the API.

pub mod types;

pub use types::{AggregateId, CorrelationId, IdempotencyKey};
