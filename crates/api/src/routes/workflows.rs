//! Workflow commands: start, resume and cancel.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use common::{AggregateId, CorrelationId};
use event_store::EventStore;
use saga::{ContextMap, InstanceSummary};
use serde::Deserialize;

use super::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct StartRequest {
    pub definition_id: String,
    #[serde(default)]
    pub context: ContextMap,
}

#[derive(Deserialize)]
pub struct ResumeRequest {
    pub correlation_id: String,
    #[serde(default)]
    pub payload: ContextMap,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub instance_id: String,
    pub reason: Option<String>,
}

// -- Handlers --

/// POST /workflows/start: create an instance and drive it until it parks or
/// settles.
#[tracing::instrument(skip(state, body))]
pub async fn start<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InstanceSummary>), ApiError> {
    let Json(req) = body?;
    if req.definition_id.trim().is_empty() {
        return Err(ApiError::BadRequest("definition_id is required".to_string()));
    }

    let summary = state.engine.start(&req.definition_id, req.context).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// POST /workflows/resume: deliver an external callback.
#[tracing::instrument(skip(state, body))]
pub async fn resume<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Result<Json<ResumeRequest>, JsonRejection>,
) -> Result<Json<InstanceSummary>, ApiError> {
    let Json(req) = body?;
    if req.correlation_id.is_empty() {
        return Err(ApiError::BadRequest("correlation_id is required".to_string()));
    }

    let correlation_id = CorrelationId::new(req.correlation_id);
    let summary = state.engine.resume(&correlation_id, req.payload).await?;
    Ok(Json(summary))
}

/// POST /workflows/cancel: cancel a running or waiting instance.
#[tracing::instrument(skip(state, body))]
pub async fn cancel<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<InstanceSummary>, ApiError> {
    let Json(req) = body?;
    let instance_id = parse_instance_id(&req.instance_id)?;

    let summary = state.engine.cancel(instance_id, req.reason).await?;
    Ok(Json(summary))
}

pub(crate) fn parse_instance_id(id: &str) -> Result<AggregateId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid instance id: {e}")))?;
    Ok(AggregateId::from_uuid(uuid))
}
