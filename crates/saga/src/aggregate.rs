//! Workflow instance aggregate.

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, IdempotencyKey};
use domain::Aggregate;
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;
use crate::events::WorkflowEvent;
use crate::state::{InstanceStatus, StepStatus};
use crate::step::{ContextMap, FailureKind};

/// Whether a record describes a forward attempt or a compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPhase {
    Forward,
    Compensation,
}

/// One entry of an instance's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub step_index: usize,
    pub step_name: String,
    pub phase: RecordPhase,
    pub attempt: u32,
    pub status: StepStatus,
    pub idempotency_key: IdempotencyKey,
    pub result: Option<ContextMap>,
    pub error: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The wait an instance is parked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedWait {
    pub step_index: usize,
    pub step_name: String,
    pub correlation_id: CorrelationId,
    pub expires_at: DateTime<Utc>,
    pub resume_schema_version: i32,
}

/// An event-sourced workflow instance.
///
/// Mutated only by applying [`WorkflowEvent`]s; the engine is the only
/// writer. Terminal instances are kept for audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowInstance {
    id: Option<AggregateId>,
    version: Version,
    definition_id: String,
    definition_version: u32,
    context: ContextMap,
    status: InstanceStatus,
    current_step_index: usize,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    records: Vec<StepExecutionRecord>,
    awaiting: Option<ParkedWait>,
    failure_reason: Option<String>,
    /// Steps whose outcome must be reconciled by hand.
    reconciliation_steps: Vec<String>,
    /// Steps reported on the terminal COMPENSATION_FAILED event.
    failed_steps: Vec<String>,
}

impl Aggregate for WorkflowInstance {
    type Event = WorkflowEvent;

    fn aggregate_type() -> &'static str {
        "WorkflowInstance"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            WorkflowEvent::InstanceStarted(data) => {
                self.id = Some(data.instance_id);
                self.definition_id = data.definition_id;
                self.definition_version = data.definition_version;
                self.context = data.context;
                self.status = InstanceStatus::Running;
                self.current_step_index = 0;
                self.created_at = Some(data.started_at);
                self.updated_at = Some(data.started_at);
            }
            WorkflowEvent::StepAttemptStarted(data) => {
                self.records.push(StepExecutionRecord {
                    step_index: data.step_index,
                    step_name: data.step_name,
                    phase: RecordPhase::Forward,
                    attempt: data.attempt,
                    status: StepStatus::Running,
                    idempotency_key: data.idempotency_key,
                    result: None,
                    error: None,
                    correlation_id: None,
                    started_at: data.started_at,
                    finished_at: None,
                });
                self.updated_at = Some(data.started_at);
            }
            WorkflowEvent::StepSucceeded(data) => {
                if let Some(record) = self.open_record_mut(data.step_index) {
                    record.status = StepStatus::Succeeded;
                    record.result = Some(data.fields.clone());
                    record.finished_at = Some(data.finished_at);
                }
                merge(&mut self.context, data.fields);
                self.current_step_index = data.step_index + 1;
                self.updated_at = Some(data.finished_at);
            }
            WorkflowEvent::StepFailed(data) => {
                if let Some(record) = self.open_record_mut(data.step_index) {
                    record.status = StepStatus::Failed;
                    record.error = Some(data.error.clone());
                    record.finished_at = Some(data.finished_at);
                }
                if !data.will_retry {
                    if data.kind == FailureKind::ReconciliationRequired {
                        self.reconciliation_steps.push(data.step_name.clone());
                    }
                    self.status = InstanceStatus::Compensating;
                    self.failure_reason = Some(format!("{}: {}", data.step_name, data.error));
                }
                self.updated_at = Some(data.finished_at);
            }
            WorkflowEvent::StepParked(data) => {
                if let Some(record) = self.open_record_mut(data.step_index) {
                    record.correlation_id = Some(data.correlation_id.clone());
                    record.result = Some(data.fields.clone());
                }
                merge(&mut self.context, data.fields);
                self.status = InstanceStatus::AwaitingEvent;
                self.awaiting = Some(ParkedWait {
                    step_index: data.step_index,
                    step_name: data.step_name,
                    correlation_id: data.correlation_id,
                    expires_at: data.expires_at,
                    resume_schema_version: data.resume_schema_version,
                });
            }
            WorkflowEvent::StepResumed(data) => {
                if let Some(record) = self.open_record_mut(data.step_index) {
                    record.status = StepStatus::Succeeded;
                    let result = record.result.get_or_insert_with(ContextMap::new);
                    merge(result, data.payload.clone());
                    record.finished_at = Some(data.resumed_at);
                }
                merge(&mut self.context, data.payload);
                self.current_step_index = data.step_index + 1;
                self.status = InstanceStatus::Running;
                self.awaiting = None;
                self.updated_at = Some(data.resumed_at);
            }
            WorkflowEvent::WaitTimedOut(data) => {
                if let Some(record) = self.open_record_mut(data.step_index) {
                    record.status = StepStatus::Failed;
                    record.error = Some("timed out waiting for callback".to_string());
                    record.finished_at = Some(data.fired_at);
                }
                self.status = InstanceStatus::Compensating;
                self.awaiting = None;
                self.failure_reason = Some(format!("{}: wait timed out", data.step_name));
                self.updated_at = Some(data.fired_at);
            }
            WorkflowEvent::CancelRequested(data) => {
                for record in self.records.iter_mut().filter(|r| {
                    r.phase == RecordPhase::Forward && r.status == StepStatus::Running
                }) {
                    record.status = StepStatus::Failed;
                    record.error = Some("cancelled".to_string());
                    record.finished_at = Some(data.requested_at);
                }
                self.status = InstanceStatus::Compensating;
                self.awaiting = None;
                self.failure_reason = Some(match data.reason {
                    Some(reason) => format!("cancelled: {reason}"),
                    None => "cancelled".to_string(),
                });
                self.updated_at = Some(data.requested_at);
            }
            WorkflowEvent::StepCompensated(data) => {
                self.push_compensation(data, StepStatus::Compensated);
            }
            WorkflowEvent::StepCompensationFailed(data) => {
                self.push_compensation(data, StepStatus::CompensationFailed);
            }
            WorkflowEvent::InstanceCompleted(data) => {
                self.status = InstanceStatus::Completed;
                self.updated_at = Some(data.completed_at);
            }
            WorkflowEvent::InstanceFailed(data) => {
                self.status = InstanceStatus::Failed;
                self.failure_reason.get_or_insert(data.reason);
                self.updated_at = Some(data.failed_at);
            }
            WorkflowEvent::InstanceCompensationFailed(data) => {
                self.status = InstanceStatus::CompensationFailed;
                self.failed_steps = data.failed_steps;
                self.failure_reason.get_or_insert(data.reason);
                self.updated_at = Some(data.failed_at);
            }
        }
    }
}

fn merge(target: &mut ContextMap, fields: ContextMap) {
    for (key, value) in fields {
        target.insert(key, value);
    }
}

impl WorkflowInstance {
    fn open_record_mut(&mut self, step_index: usize) -> Option<&mut StepExecutionRecord> {
        self.records.iter_mut().rev().find(|r| {
            r.phase == RecordPhase::Forward
                && r.step_index == step_index
                && r.status == StepStatus::Running
        })
    }

    fn push_compensation(
        &mut self,
        data: crate::events::StepCompensationData,
        status: StepStatus,
    ) {
        self.records.push(StepExecutionRecord {
            step_index: data.step_index,
            step_name: data.step_name,
            phase: RecordPhase::Compensation,
            attempt: data.attempts,
            status,
            idempotency_key: data.idempotency_key,
            result: None,
            error: data.error,
            correlation_id: None,
            started_at: data.finished_at,
            finished_at: Some(data.finished_at),
        });
        self.updated_at = Some(data.finished_at);
    }

    /// Decides the events of a cancel request.
    pub fn request_cancel(
        &self,
        instance_id: AggregateId,
        reason: Option<String>,
    ) -> Result<Vec<WorkflowEvent>, SagaError> {
        if self.id.is_none() {
            return Err(SagaError::InstanceNotFound(instance_id));
        }
        if !self.status.can_cancel() {
            return Err(SagaError::InvalidState {
                instance_id,
                status: self.status,
                operation: "cancel",
            });
        }
        Ok(vec![WorkflowEvent::cancel_requested(reason)])
    }
}

// Query methods
impl WorkflowInstance {
    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn definition_version(&self) -> u32 {
        self.definition_version
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// The full ordered execution history.
    pub fn records(&self) -> &[StepExecutionRecord] {
        &self.records
    }

    pub fn awaiting(&self) -> Option<&ParkedWait> {
        self.awaiting.as_ref()
    }

    /// Returns true if the instance is parked on `correlation_id`.
    pub fn is_awaiting(&self, correlation_id: &CorrelationId) -> bool {
        self.status == InstanceStatus::AwaitingEvent
            && self
                .awaiting
                .as_ref()
                .is_some_and(|w| &w.correlation_id == correlation_id)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn failed_steps(&self) -> &[String] {
        &self.failed_steps
    }

    /// Forward attempts of one step, oldest first.
    pub fn forward_attempts(&self, step_index: usize) -> Vec<&StepExecutionRecord> {
        self.records
            .iter()
            .filter(|r| r.phase == RecordPhase::Forward && r.step_index == step_index)
            .collect()
    }

    /// Succeeded steps still to be compensated, most recent first.
    pub fn compensation_plan(&self) -> Vec<&StepExecutionRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.phase == RecordPhase::Forward && r.status == StepStatus::Succeeded)
            .filter(|r| {
                !self.records.iter().any(|c| {
                    c.phase == RecordPhase::Compensation && c.step_index == r.step_index
                })
            })
            .collect()
    }

    /// Steps that need an operator: failed compensations and reconciliations.
    pub fn intervention_steps(&self) -> Vec<String> {
        let mut steps = self.reconciliation_steps.clone();
        for record in &self.records {
            if record.status == StepStatus::CompensationFailed && !steps.contains(&record.step_name)
            {
                steps.push(record.step_name.clone());
            }
        }
        steps
    }

    /// Re-derives the step position from the SUCCEEDED records alone.
    ///
    /// Each step succeeds at most once and steps run in order, so this always
    /// equals [`current_step_index`](Self::current_step_index).
    pub fn replayed_position(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.phase == RecordPhase::Forward && r.status == StepStatus::Succeeded)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{StepCompensationData, StepParkedData, StepResumedData, WaitTimedOutData};
    use crate::fields;

    fn started(id: AggregateId) -> WorkflowInstance {
        let mut instance = WorkflowInstance::default();
        instance.apply(WorkflowEvent::instance_started(
            id,
            "invoice-financing",
            1,
            fields! { "invoice_id" => "INV-1" },
        ));
        instance
    }

    fn succeed(instance: &mut WorkflowInstance, index: usize, name: &str) {
        let id = instance.id().unwrap();
        instance.apply(WorkflowEvent::attempt_started(
            index,
            name,
            1,
            IdempotencyKey::derive(id, name, 1),
        ));
        instance.apply(WorkflowEvent::step_succeeded(
            index,
            name,
            1,
            fields! { format!("{name}_done") => true },
            false,
        ));
    }

    fn park(instance: &mut WorkflowInstance, index: usize, name: &str, cid: &str) {
        let id = instance.id().unwrap();
        instance.apply(WorkflowEvent::attempt_started(
            index,
            name,
            1,
            IdempotencyKey::derive(id, name, 1),
        ));
        instance.apply(WorkflowEvent::StepParked(StepParkedData {
            step_index: index,
            step_name: name.to_string(),
            attempt: 1,
            correlation_id: CorrelationId::new(cid),
            expires_at: Utc::now(),
            resume_schema_version: 1,
            fields: fields! { "offer_request_id" => "REQ-1" },
        }));
    }

    #[test]
    fn started_instance_is_running_at_step_zero() {
        let id = AggregateId::new();
        let instance = started(id);
        assert_eq!(instance.id(), Some(id));
        assert_eq!(instance.status(), InstanceStatus::Running);
        assert_eq!(instance.current_step_index(), 0);
        assert_eq!(instance.definition_id(), "invoice-financing");
        assert_eq!(instance.context()["invoice_id"], "INV-1");
    }

    #[test]
    fn success_advances_and_merges_context() {
        let mut instance = started(AggregateId::new());
        succeed(&mut instance, 0, "lock_invoice");
        succeed(&mut instance, 1, "assess_credit");

        assert_eq!(instance.current_step_index(), 2);
        assert_eq!(instance.context()["lock_invoice_done"], true);
        assert_eq!(instance.records().len(), 2);
        assert!(instance
            .records()
            .iter()
            .all(|r| r.status == StepStatus::Succeeded));
        assert_eq!(instance.replayed_position(), instance.current_step_index());
    }

    #[test]
    fn retried_failure_keeps_running() {
        let mut instance = started(AggregateId::new());
        let id = instance.id().unwrap();
        let key = IdempotencyKey::derive(id, "lock_invoice", 1);
        instance.apply(WorkflowEvent::attempt_started(0, "lock_invoice", 1, key.clone()));
        instance.apply(WorkflowEvent::step_failed(
            0,
            "lock_invoice",
            1,
            FailureKind::Transient,
            "503",
            true,
        ));
        assert_eq!(instance.status(), InstanceStatus::Running);

        instance.apply(WorkflowEvent::attempt_started(0, "lock_invoice", 2, key));
        instance.apply(WorkflowEvent::step_succeeded(0, "lock_invoice", 2, fields! {}, false));

        let attempts = instance.forward_attempts(0);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, StepStatus::Failed);
        assert_eq!(attempts[1].status, StepStatus::Succeeded);
        assert_eq!(attempts[0].idempotency_key, attempts[1].idempotency_key);
        assert_eq!(instance.replayed_position(), 1);
    }

    #[test]
    fn final_failure_starts_compensation() {
        let mut instance = started(AggregateId::new());
        succeed(&mut instance, 0, "lock_invoice");
        let key = IdempotencyKey::derive(instance.id().unwrap(), "assess_credit", 1);
        instance.apply(WorkflowEvent::attempt_started(1, "assess_credit", 1, key));
        instance.apply(WorkflowEvent::step_failed(
            1,
            "assess_credit",
            1,
            FailureKind::Permanent,
            "limit exceeded",
            false,
        ));

        assert_eq!(instance.status(), InstanceStatus::Compensating);
        assert_eq!(instance.failure_reason(), Some("assess_credit: limit exceeded"));
        let plan: Vec<_> = instance
            .compensation_plan()
            .iter()
            .map(|r| r.step_name.clone())
            .collect();
        assert_eq!(plan, vec!["lock_invoice"]);
        assert_eq!(instance.replayed_position(), instance.current_step_index());
    }

    #[test]
    fn park_and_resume() {
        let mut instance = started(AggregateId::new());
        succeed(&mut instance, 0, "lock_invoice");
        park(&mut instance, 1, "request_offers", "corr-1");

        assert_eq!(instance.status(), InstanceStatus::AwaitingEvent);
        assert!(instance.is_awaiting(&CorrelationId::new("corr-1")));
        assert!(!instance.is_awaiting(&CorrelationId::new("corr-2")));
        assert_eq!(instance.current_step_index(), 1);

        instance.apply(WorkflowEvent::StepResumed(StepResumedData {
            step_index: 1,
            step_name: "request_offers".to_string(),
            correlation_id: CorrelationId::new("corr-1"),
            payload: fields! { "offer_id" => "OFFER-7" },
            resumed_at: Utc::now(),
        }));

        assert_eq!(instance.status(), InstanceStatus::Running);
        assert_eq!(instance.current_step_index(), 2);
        assert!(instance.awaiting().is_none());
        assert_eq!(instance.context()["offer_id"], "OFFER-7");
        let record = &instance.forward_attempts(1)[0];
        assert_eq!(record.status, StepStatus::Succeeded);
        assert_eq!(record.result.as_ref().unwrap()["offer_request_id"], "REQ-1");
        assert_eq!(record.result.as_ref().unwrap()["offer_id"], "OFFER-7");
        assert_eq!(instance.replayed_position(), 2);
    }

    #[test]
    fn timeout_fails_parked_step_and_compensates() {
        let mut instance = started(AggregateId::new());
        succeed(&mut instance, 0, "lock_invoice");
        succeed(&mut instance, 1, "assess_credit");
        park(&mut instance, 2, "request_offers", "corr-1");

        instance.apply(WorkflowEvent::WaitTimedOut(WaitTimedOutData {
            step_index: 2,
            step_name: "request_offers".to_string(),
            correlation_id: CorrelationId::new("corr-1"),
            expired_at: Utc::now(),
            fired_at: Utc::now(),
        }));

        assert_eq!(instance.status(), InstanceStatus::Compensating);
        assert!(instance.awaiting().is_none());
        let plan: Vec<_> = instance
            .compensation_plan()
            .iter()
            .map(|r| r.step_name.as_str())
            .collect();
        assert_eq!(plan, vec!["assess_credit", "lock_invoice"]);
    }

    #[test]
    fn compensation_records_shrink_the_plan() {
        let mut instance = started(AggregateId::new());
        let id = instance.id().unwrap();
        succeed(&mut instance, 0, "lock_invoice");
        succeed(&mut instance, 1, "assess_credit");
        instance.apply(WorkflowEvent::cancel_requested(Some("seller withdrew".into())));

        instance.apply(WorkflowEvent::StepCompensated(StepCompensationData {
            step_index: 1,
            step_name: "assess_credit".to_string(),
            attempts: 1,
            idempotency_key: IdempotencyKey::for_compensation(id, "assess_credit", 1),
            error: None,
            finished_at: Utc::now(),
        }));
        assert_eq!(instance.compensation_plan().len(), 1);

        instance.apply(WorkflowEvent::StepCompensationFailed(StepCompensationData {
            step_index: 0,
            step_name: "lock_invoice".to_string(),
            attempts: 3,
            idempotency_key: IdempotencyKey::for_compensation(id, "lock_invoice", 1),
            error: Some("registry down".to_string()),
            finished_at: Utc::now(),
        }));
        assert!(instance.compensation_plan().is_empty());
        assert_eq!(instance.intervention_steps(), vec!["lock_invoice"]);

        instance.apply(WorkflowEvent::instance_compensation_failed(
            vec!["lock_invoice".to_string()],
            "compensation failed",
        ));
        assert_eq!(instance.status(), InstanceStatus::CompensationFailed);
        assert_eq!(instance.failed_steps(), ["lock_invoice"]);
        assert_eq!(instance.failure_reason(), Some("cancelled: seller withdrew"));
        assert_eq!(instance.replayed_position(), instance.current_step_index());
    }

    #[test]
    fn cancel_only_while_running_or_waiting() {
        let id = AggregateId::new();
        assert!(matches!(
            WorkflowInstance::default().request_cancel(id, None),
            Err(SagaError::InstanceNotFound(missing)) if missing == id
        ));

        let mut instance = started(id);
        assert_eq!(instance.request_cancel(id, None).unwrap().len(), 1);

        instance.apply(WorkflowEvent::instance_completed());
        assert!(matches!(
            instance.request_cancel(id, None),
            Err(SagaError::InvalidState { operation: "cancel", .. })
        ));
    }

    #[test]
    fn cancel_while_parked_fails_the_wait() {
        let mut instance = started(AggregateId::new());
        park(&mut instance, 0, "request_offers", "corr-9");
        instance.apply(WorkflowEvent::cancel_requested(None));

        assert_eq!(instance.status(), InstanceStatus::Compensating);
        assert!(instance.awaiting().is_none());
        assert_eq!(instance.forward_attempts(0)[0].status, StepStatus::Failed);
        assert!(instance.compensation_plan().is_empty());
    }
}
