//! Read model views for the CQRS query side.

pub mod active_instances;
pub mod operator_queue;

pub use active_instances::{ActiveInstanceSummary, ActiveInstancesView};
pub use operator_queue::{InterventionKind, OperatorQueueEntry, OperatorQueueView, StuckStep};
