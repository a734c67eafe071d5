//! Read models and projections for the workflow query side.
//!
//! [`ProjectionProcessor`] streams the log, decodes workflow entries into
//! [`InstanceEvent`]s and feeds them to each [`Projection`]. Two views are
//! provided: active instances, and the operator queue of instances that need
//! manual intervention.

pub mod error;
pub mod processor;
pub mod projection;
pub mod views;

pub use error::{ProjectionError, Result};
pub use processor::ProjectionProcessor;
pub use projection::{Checkpoint, InstanceEvent, Projection};
pub use views::{
    ActiveInstanceSummary, ActiveInstancesView, InterventionKind, OperatorQueueEntry,
    OperatorQueueView, StuckStep,
};
