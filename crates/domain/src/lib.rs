//! Domain layer for the workflow engine.
//!
//! This crate provides the event-sourcing abstractions the engine is built on:
//! - Aggregate trait for event-sourced entities
//! - DomainEvent trait for domain events
//! - AggregateRepository for replaying streams and version-checked appends

pub mod aggregate;
pub mod error;
pub mod repository;

pub use aggregate::{Aggregate, DomainEvent};
pub use error::DomainError;
pub use repository::{AggregateRepository, EventMetadata};
