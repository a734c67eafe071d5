//! Operator queue read model: instances that need manual intervention.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::AggregateId;
use saga::{FailureKind, WorkflowEvent};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::{InstanceEvent, Projection};

/// Why a step landed in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    /// The step's compensation failed.
    CompensationFailed,
    /// The step's outcome is unknown and must be reconciled.
    Reconciliation,
}

/// One step an operator has to look at.
#[derive(Debug, Clone, Serialize)]
pub struct StuckStep {
    pub step_name: String,
    pub kind: InterventionKind,
    pub error: Option<String>,
}

/// An instance that ended in COMPENSATION_FAILED.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorQueueEntry {
    pub instance_id: AggregateId,
    pub definition_id: String,
    pub reason: String,
    pub failed_steps: Vec<String>,
    pub steps: Vec<StuckStep>,
    pub failed_at: DateTime<Utc>,
}

/// Per-instance facts gathered until the instance settles.
#[derive(Debug, Default)]
struct Tracking {
    definition_id: String,
    steps: Vec<StuckStep>,
}

/// Read model view listing COMPENSATION_FAILED instances with the steps that
/// need attention.
#[derive(Clone)]
pub struct OperatorQueueView {
    tracking: Arc<RwLock<HashMap<AggregateId, Tracking>>>,
    queue: Arc<RwLock<HashMap<AggregateId, OperatorQueueEntry>>>,
}

impl OperatorQueueView {
    pub fn new() -> Self {
        Self {
            tracking: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, instance_id: AggregateId) -> Option<OperatorQueueEntry> {
        self.queue.read().await.get(&instance_id).cloned()
    }

    /// Queue entries, oldest failure first.
    pub async fn entries(&self) -> Vec<OperatorQueueEntry> {
        let mut entries: Vec<_> = self.queue.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.failed_at);
        entries
    }

    pub async fn count(&self) -> usize {
        self.queue.read().await.len()
    }

    /// Queue entries that include `step_name`.
    pub async fn entries_for_step(&self, step_name: &str) -> Vec<OperatorQueueEntry> {
        self.entries()
            .await
            .into_iter()
            .filter(|e| e.failed_steps.iter().any(|s| s == step_name))
            .collect()
    }
}

impl Default for OperatorQueueView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for OperatorQueueView {
    fn name(&self) -> &'static str {
        "OperatorQueueView"
    }

    async fn apply(&self, event: &InstanceEvent) -> Result<()> {
        let instance_id = event.instance_id;

        let mut tracking = self.tracking.write().await;

        match event.event.clone() {
            WorkflowEvent::InstanceStarted(data) => {
                tracking.insert(
                    instance_id,
                    Tracking {
                        definition_id: data.definition_id,
                        steps: Vec::new(),
                    },
                );
            }
            WorkflowEvent::StepFailed(data) if data.kind == FailureKind::ReconciliationRequired => {
                if let Some(t) = tracking.get_mut(&instance_id) {
                    t.steps.push(StuckStep {
                        step_name: data.step_name,
                        kind: InterventionKind::Reconciliation,
                        error: Some(data.error),
                    });
                }
            }
            WorkflowEvent::StepCompensationFailed(data) => {
                if let Some(t) = tracking.get_mut(&instance_id) {
                    t.steps.push(StuckStep {
                        step_name: data.step_name,
                        kind: InterventionKind::CompensationFailed,
                        error: data.error,
                    });
                }
            }
            WorkflowEvent::InstanceCompensationFailed(data) => {
                let t = tracking.remove(&instance_id).unwrap_or_default();
                self.queue.write().await.insert(
                    instance_id,
                    OperatorQueueEntry {
                        instance_id,
                        definition_id: t.definition_id,
                        reason: data.reason,
                        failed_steps: data.failed_steps,
                        steps: t.steps,
                        failed_at: data.failed_at,
                    },
                );
                tracing::debug!(%instance_id, "instance added to operator queue");
            }
            WorkflowEvent::InstanceCompleted(_) | WorkflowEvent::InstanceFailed(_) => {
                tracking.remove(&instance_id);
            }
            _ => {}
        }

        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.tracking.write().await.clear();
        self.queue.write().await.clear();
        Ok(())
    }
}
