//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use event_store::EventStore;
use serde::Serialize;

use super::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Instances parked on an external callback.
    pub pending_waits: usize,
}

/// GET /health: returns system health status. Fails when the wait registry
/// cannot be reached.
pub async fn check<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let pending_waits = state.engine.pending_waits().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        pending_waits,
    }))
}
