//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;

use super::AppState;

/// State for the scrape endpoint: the recorder handle plus the engine, so
/// gauges that are cheaper to read on demand can be refreshed per scrape.
pub struct MetricsState<S: EventStore> {
    pub app: Arc<AppState<S>>,
    pub handle: PrometheusHandle,
}

impl<S: EventStore> Clone for MetricsState<S> {
    fn clone(&self) -> Self {
        Self {
            app: self.app.clone(),
            handle: self.handle.clone(),
        }
    }
}

/// GET /metrics: Prometheus text format.
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<MetricsState<S>>,
) -> impl IntoResponse {
    match state.app.engine.pending_waits().await {
        Ok(pending) => ::metrics::gauge!("workflow_pending_waits").set(pending as f64),
        Err(err) => tracing::warn!(error = %err, "could not read pending waits for scrape"),
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.handle.render(),
    )
}
