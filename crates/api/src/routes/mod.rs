//! HTTP route handlers and the state they share.

pub mod health;
pub mod instances;
pub mod metrics;
pub mod workflows;

use std::sync::Arc;

use event_store::EventStore;
use projections::{ActiveInstancesView, OperatorQueueView, ProjectionProcessor};
use saga::{BroadcastPublisher, WorkflowEngine};

/// Shared application state accessible from all handlers.
pub struct AppState<S: EventStore> {
    pub engine: Arc<WorkflowEngine<S>>,
    pub projection_processor: Arc<ProjectionProcessor<S>>,
    pub active_instances: ActiveInstancesView,
    pub operator_queue: OperatorQueueView,
    pub notifications: Arc<BroadcastPublisher>,
}
