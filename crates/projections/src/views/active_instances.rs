//! Active instances read model: non-terminal workflow instances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use saga::{InstanceStatus, WorkflowEvent};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::{InstanceEvent, Projection};

/// Summary of an instance that has not reached a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveInstanceSummary {
    pub instance_id: AggregateId,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub current_step_index: usize,
    /// Name of the step currently being attempted, if any.
    pub current_step: Option<String>,
    pub awaiting: Option<CorrelationId>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read model view for running, waiting and compensating instances.
///
/// Instances are removed when they reach COMPLETED, FAILED or
/// COMPENSATION_FAILED.
#[derive(Clone)]
pub struct ActiveInstancesView {
    instances: Arc<RwLock<HashMap<AggregateId, ActiveInstanceSummary>>>,
}

impl ActiveInstancesView {
    pub fn new() -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, instance_id: AggregateId) -> Option<ActiveInstanceSummary> {
        self.instances.read().await.get(&instance_id).cloned()
    }

    /// All active instances, oldest first.
    pub async fn all(&self) -> Vec<ActiveInstanceSummary> {
        let mut all: Vec<_> = self.instances.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Active instances in `status`, oldest first.
    pub async fn by_status(&self, status: InstanceStatus) -> Vec<ActiveInstanceSummary> {
        let mut matching: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.started_at);
        matching
    }

    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Number of active instances per status.
    pub async fn count_by_status(&self) -> HashMap<InstanceStatus, usize> {
        let mut counts = HashMap::new();
        for summary in self.instances.read().await.values() {
            *counts.entry(summary.status).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for ActiveInstancesView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for ActiveInstancesView {
    fn name(&self) -> &'static str {
        "ActiveInstancesView"
    }

    async fn apply(&self, event: &InstanceEvent) -> Result<()> {
        let instance_id = event.instance_id;

        let mut instances = self.instances.write().await;

        match event.event.clone() {
            WorkflowEvent::InstanceStarted(data) => {
                instances.insert(
                    instance_id,
                    ActiveInstanceSummary {
                        instance_id,
                        definition_id: data.definition_id,
                        definition_version: data.definition_version,
                        status: InstanceStatus::Running,
                        current_step_index: 0,
                        current_step: None,
                        awaiting: None,
                        started_at: data.started_at,
                        updated_at: data.started_at,
                    },
                );
            }
            WorkflowEvent::StepAttemptStarted(data) => {
                if let Some(summary) = instances.get_mut(&instance_id) {
                    summary.current_step_index = data.step_index;
                    summary.current_step = Some(data.step_name);
                    summary.updated_at = data.started_at;
                }
            }
            WorkflowEvent::StepSucceeded(data) => {
                if let Some(summary) = instances.get_mut(&instance_id) {
                    summary.current_step_index = data.step_index + 1;
                    summary.current_step = None;
                    summary.updated_at = data.finished_at;
                }
            }
            WorkflowEvent::StepFailed(data) => {
                if let Some(summary) = instances.get_mut(&instance_id) {
                    if !data.will_retry {
                        summary.status = InstanceStatus::Compensating;
                        summary.current_step = None;
                    }
                    summary.updated_at = data.finished_at;
                }
            }
            WorkflowEvent::StepParked(data) => {
                if let Some(summary) = instances.get_mut(&instance_id) {
                    summary.status = InstanceStatus::AwaitingEvent;
                    summary.awaiting = Some(data.correlation_id);
                    summary.updated_at = event.recorded_at;
                }
            }
            WorkflowEvent::StepResumed(data) => {
                if let Some(summary) = instances.get_mut(&instance_id) {
                    summary.status = InstanceStatus::Running;
                    summary.current_step_index = data.step_index + 1;
                    summary.current_step = None;
                    summary.awaiting = None;
                    summary.updated_at = data.resumed_at;
                }
            }
            WorkflowEvent::WaitTimedOut(data) => {
                if let Some(summary) = instances.get_mut(&instance_id) {
                    summary.status = InstanceStatus::Compensating;
                    summary.current_step = None;
                    summary.awaiting = None;
                    summary.updated_at = data.fired_at;
                }
            }
            WorkflowEvent::CancelRequested(data) => {
                if let Some(summary) = instances.get_mut(&instance_id) {
                    summary.status = InstanceStatus::Compensating;
                    summary.current_step = None;
                    summary.awaiting = None;
                    summary.updated_at = data.requested_at;
                }
            }
            WorkflowEvent::StepCompensated(data) | WorkflowEvent::StepCompensationFailed(data) => {
                if let Some(summary) = instances.get_mut(&instance_id) {
                    summary.updated_at = data.finished_at;
                }
            }
            WorkflowEvent::InstanceCompleted(_)
            | WorkflowEvent::InstanceFailed(_)
            | WorkflowEvent::InstanceCompensationFailed(_) => {
                instances.remove(&instance_id);
            }
        }

        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.instances.write().await.clear();
        Ok(())
    }
}
