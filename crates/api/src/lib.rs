//! HTTP API server for the workflow engine.
//!
//! Provides REST endpoints to start, resume and cancel workflow instances and
//! to query their history, with structured logging (tracing) and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use projections::{ActiveInstancesView, OperatorQueueView, Projection, ProjectionProcessor};
use saga::financing::{self, InMemoryFinancingServices};
use saga::{
    BroadcastPublisher, DedupeLedger, DefinitionRegistry, EngineConfig, InMemoryDedupeLedger,
    InMemoryWaitRegistry, SagaError, WaitRegistry, WorkflowEngine,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use routes::AppState;

/// Buffered notifications per subscriber before the slowest one lags.
const NOTIFICATION_CAPACITY: usize = 1024;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: EventStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get::<S>))
        .with_state(routes::metrics::MetricsState {
            app: state.clone(),
            handle: metrics_handle,
        });

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/workflows/start", post(routes::workflows::start::<S>))
        .route("/workflows/resume", post(routes::workflows::resume::<S>))
        .route("/workflows/cancel", post(routes::workflows::cancel::<S>))
        .route("/instances", get(routes::instances::list::<S>))
        .route("/instances/{id}", get(routes::instances::get::<S>))
        .route("/operator-queue", get(routes::instances::operator_queue::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the engine, registers the invoice-financing workflow over in-memory
/// collaborators and wires the read-side projections.
///
/// The collaborators are returned so callers can inspect effects or inject
/// faults.
pub fn create_state<S: EventStore + Clone + 'static>(
    event_store: S,
    waits: Arc<dyn WaitRegistry>,
    ledger: Arc<dyn DedupeLedger>,
    config: EngineConfig,
) -> Result<(Arc<AppState<S>>, InMemoryFinancingServices), SagaError> {
    let services = InMemoryFinancingServices::new(financing::DEFAULT_CREDIT_LIMIT_CENTS);
    let mut registry = DefinitionRegistry::new();
    registry.register(financing::definition(
        &services.services(),
        financing::DEFAULT_OFFER_TIMEOUT,
    ))?;

    let notifications = Arc::new(BroadcastPublisher::new(NOTIFICATION_CAPACITY));
    let engine = WorkflowEngine::new(event_store.clone(), Arc::new(registry), waits, ledger, config)
        .with_publisher(notifications.clone());

    let active_instances = ActiveInstancesView::new();
    let operator_queue = OperatorQueueView::new();
    let mut processor = ProjectionProcessor::new(event_store);
    processor.register(Box::new(active_instances.clone()) as Box<dyn Projection>);
    processor.register(Box::new(operator_queue.clone()) as Box<dyn Projection>);

    let state = Arc::new(AppState {
        engine: Arc::new(engine),
        projection_processor: Arc::new(processor),
        active_instances,
        operator_queue,
        notifications,
    });

    Ok((state, services))
}

/// Application state over in-memory wait registry and dedupe ledger.
pub fn create_default_state<S: EventStore + Clone + 'static>(
    event_store: S,
    config: EngineConfig,
) -> Result<(Arc<AppState<S>>, InMemoryFinancingServices), SagaError> {
    create_state(
        event_store,
        Arc::new(InMemoryWaitRegistry::new()),
        Arc::new(InMemoryDedupeLedger::new()),
        config,
    )
}

/// Logs every engine notification until the publisher is dropped.
pub fn spawn_notification_log(publisher: &BroadcastPublisher) -> tokio::task::JoinHandle<()> {
    let mut rx = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => tracing::info!(
                    topic = %notification.topic,
                    instance_id = %notification.instance_id,
                    step = notification.step_name.as_deref().unwrap_or(""),
                    "notification"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
