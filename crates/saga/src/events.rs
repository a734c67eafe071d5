//! Workflow instance events: the persisted transitions of an instance.

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, IdempotencyKey};
use domain::DomainEvent;
use serde::{Deserialize, Serialize};

use crate::step::{ContextMap, FailureKind};

/// Every state transition of a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkflowEvent {
    /// The instance was created at step 0.
    InstanceStarted(InstanceStartedData),

    /// Write-ahead record: a forward attempt is about to call the step.
    StepAttemptStarted(StepAttemptData),

    /// The attempt finished successfully.
    StepSucceeded(StepSucceededData),

    /// The attempt failed; compensation starts unless it will be retried.
    StepFailed(StepFailedData),

    /// The attempt handed a correlation id to an external system.
    StepParked(StepParkedData),

    /// The external callback arrived and the parked step succeeded.
    StepResumed(StepResumedData),

    /// The wait deadline passed before a callback; compensation starts.
    WaitTimedOut(WaitTimedOutData),

    /// An operator or caller cancelled the instance; compensation starts.
    CancelRequested(CancelRequestedData),

    /// A completed step was undone.
    StepCompensated(StepCompensationData),

    /// A completed step could not be undone.
    StepCompensationFailed(StepCompensationData),

    /// Every step succeeded.
    InstanceCompleted(InstanceCompletedData),

    /// Compensation finished cleanly.
    InstanceFailed(InstanceFailedData),

    /// Compensation finished with failures; manual intervention required.
    InstanceCompensationFailed(InstanceCompensationFailedData),
}

impl DomainEvent for WorkflowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::InstanceStarted(_) => "InstanceStarted",
            WorkflowEvent::StepAttemptStarted(_) => "StepAttemptStarted",
            WorkflowEvent::StepSucceeded(_) => "StepSucceeded",
            WorkflowEvent::StepFailed(_) => "StepFailed",
            WorkflowEvent::StepParked(_) => "StepParked",
            WorkflowEvent::StepResumed(_) => "StepResumed",
            WorkflowEvent::WaitTimedOut(_) => "WaitTimedOut",
            WorkflowEvent::CancelRequested(_) => "CancelRequested",
            WorkflowEvent::StepCompensated(_) => "StepCompensated",
            WorkflowEvent::StepCompensationFailed(_) => "StepCompensationFailed",
            WorkflowEvent::InstanceCompleted(_) => "InstanceCompleted",
            WorkflowEvent::InstanceFailed(_) => "InstanceFailed",
            WorkflowEvent::InstanceCompensationFailed(_) => "InstanceCompensationFailed",
        }
    }
}

/// Data for InstanceStarted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStartedData {
    pub instance_id: AggregateId,
    pub definition_id: String,
    pub definition_version: u32,
    pub context: ContextMap,
    pub started_at: DateTime<Utc>,
}

/// Data for StepAttemptStarted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttemptData {
    pub step_index: usize,
    pub step_name: String,
    pub attempt: u32,
    pub idempotency_key: IdempotencyKey,
    pub started_at: DateTime<Utc>,
}

/// Data for StepSucceeded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSucceededData {
    pub step_index: usize,
    pub step_name: String,
    pub attempt: u32,
    pub fields: ContextMap,
    /// The result came from the dedupe ledger rather than a fresh call.
    #[serde(default)]
    pub from_ledger: bool,
    pub finished_at: DateTime<Utc>,
}

/// Data for StepFailed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub attempt: u32,
    pub kind: FailureKind,
    pub error: String,
    /// Another attempt follows; the instance keeps running.
    pub will_retry: bool,
    pub finished_at: DateTime<Utc>,
}

/// Data for StepParked event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepParkedData {
    pub step_index: usize,
    pub step_name: String,
    pub attempt: u32,
    pub correlation_id: CorrelationId,
    pub expires_at: DateTime<Utc>,
    pub resume_schema_version: i32,
    pub fields: ContextMap,
}

/// Data for StepResumed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResumedData {
    pub step_index: usize,
    pub step_name: String,
    pub correlation_id: CorrelationId,
    pub payload: ContextMap,
    pub resumed_at: DateTime<Utc>,
}

/// Data for WaitTimedOut event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitTimedOutData {
    pub step_index: usize,
    pub step_name: String,
    pub correlation_id: CorrelationId,
    pub expired_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

/// Data for CancelRequested event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequestedData {
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Data for StepCompensated and StepCompensationFailed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompensationData {
    pub step_index: usize,
    pub step_name: String,
    /// Tries spent on the compensation.
    pub attempts: u32,
    pub idempotency_key: IdempotencyKey,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Data for InstanceCompleted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCompletedData {
    pub completed_at: DateTime<Utc>,
}

/// Data for InstanceFailed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceFailedData {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Data for InstanceCompensationFailed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCompensationFailedData {
    /// Steps that could not be compensated or need reconciliation.
    pub failed_steps: Vec<String>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors
impl WorkflowEvent {
    pub fn instance_started(
        instance_id: AggregateId,
        definition_id: impl Into<String>,
        definition_version: u32,
        context: ContextMap,
    ) -> Self {
        WorkflowEvent::InstanceStarted(InstanceStartedData {
            instance_id,
            definition_id: definition_id.into(),
            definition_version,
            context,
            started_at: Utc::now(),
        })
    }

    pub fn attempt_started(
        step_index: usize,
        step_name: impl Into<String>,
        attempt: u32,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        WorkflowEvent::StepAttemptStarted(StepAttemptData {
            step_index,
            step_name: step_name.into(),
            attempt,
            idempotency_key,
            started_at: Utc::now(),
        })
    }

    pub fn step_succeeded(
        step_index: usize,
        step_name: impl Into<String>,
        attempt: u32,
        fields: ContextMap,
        from_ledger: bool,
    ) -> Self {
        WorkflowEvent::StepSucceeded(StepSucceededData {
            step_index,
            step_name: step_name.into(),
            attempt,
            fields,
            from_ledger,
            finished_at: Utc::now(),
        })
    }

    pub fn step_failed(
        step_index: usize,
        step_name: impl Into<String>,
        attempt: u32,
        kind: FailureKind,
        error: impl Into<String>,
        will_retry: bool,
    ) -> Self {
        WorkflowEvent::StepFailed(StepFailedData {
            step_index,
            step_name: step_name.into(),
            attempt,
            kind,
            error: error.into(),
            will_retry,
            finished_at: Utc::now(),
        })
    }

    pub fn instance_completed() -> Self {
        WorkflowEvent::InstanceCompleted(InstanceCompletedData {
            completed_at: Utc::now(),
        })
    }

    pub fn instance_failed(reason: impl Into<String>) -> Self {
        WorkflowEvent::InstanceFailed(InstanceFailedData {
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }

    pub fn instance_compensation_failed(failed_steps: Vec<String>, reason: impl Into<String>) -> Self {
        WorkflowEvent::InstanceCompensationFailed(InstanceCompensationFailedData {
            failed_steps,
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }

    pub fn cancel_requested(reason: Option<String>) -> Self {
        WorkflowEvent::CancelRequested(CancelRequestedData {
            reason,
            requested_at: Utc::now(),
        })
    }
}
