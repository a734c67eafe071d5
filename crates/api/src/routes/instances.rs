//! Instance queries: audit view, active instances and the operator queue.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use event_store::{EventStore, Version};
use projections::{ActiveInstanceSummary, OperatorQueueEntry};
use saga::{InstanceStatus, InstanceView};
use serde::Deserialize;

use super::AppState;
use super::workflows::parse_instance_id;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct InstanceQuery {
    /// Replay the log only up to this version.
    pub at_version: Option<i64>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<InstanceStatus>,
}

/// GET /instances/{id}: current state and full step history, or the state as
/// of `at_version`.
#[tracing::instrument(skip(state, query))]
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    query: Result<Query<InstanceQuery>, QueryRejection>,
) -> Result<Json<InstanceView>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let Query(query) = query?;

    let view = match query.at_version {
        Some(version) if version < 1 => {
            return Err(ApiError::BadRequest(format!(
                "at_version must be at least 1, got {version}"
            )));
        }
        Some(version) => {
            state
                .engine
                .instance_at(instance_id, Version::new(version))
                .await?
        }
        None => state.engine.get_instance(instance_id).await?,
    };
    Ok(Json(view))
}

/// GET /instances: non-terminal instances, optionally filtered by status.
#[tracing::instrument(skip(state, query))]
pub async fn list<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<ActiveInstanceSummary>>, ApiError> {
    let Query(query) = query?;
    state.projection_processor.run_catch_up().await?;

    let instances = match query.status {
        Some(status) => state.active_instances.by_status(status).await,
        None => state.active_instances.all().await,
    };
    Ok(Json(instances))
}

/// GET /operator-queue: instances that ended in COMPENSATION_FAILED.
#[tracing::instrument(skip(state))]
pub async fn operator_queue<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<Vec<OperatorQueueEntry>>, ApiError> {
    state.projection_processor.run_catch_up().await?;
    Ok(Json(state.operator_queue.entries().await))
}
