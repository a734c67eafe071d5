//! Compensation coordinator: unwinds the succeeded steps of a failed instance.

use common::{AggregateId, IdempotencyKey};
use domain::{AggregateRepository, EventMetadata};
use event_store::EventStore;

use crate::aggregate::WorkflowInstance;
use crate::definition::WorkflowDefinition;
use crate::error::Result;
use crate::events::{StepCompensationData, WorkflowEvent};
use crate::retry::RetryPolicy;
use crate::state::InstanceStatus;
use crate::step::{CompensationContext, ContextMap, Step};

/// Walks the log's succeeded forward records newest first and compensates
/// each one.
///
/// The walk is driven by the persisted history rather than an in-memory stack:
/// steps that already have a compensation record are skipped, so a walk
/// interrupted by a crash resumes where it stopped. A failed compensation is
/// recorded and the walk continues; the instance then ends in
/// COMPENSATION_FAILED instead of FAILED.
pub struct CompensationCoordinator {
    retry: RetryPolicy,
}

struct PendingCompensation {
    step_index: usize,
    step_name: String,
    prior_result: ContextMap,
}

impl CompensationCoordinator {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Compensates every outstanding step and commits the terminal event.
    #[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn run<S: EventStore>(
        &self,
        repo: &AggregateRepository<S, WorkflowInstance>,
        instance_id: AggregateId,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        metadata: &EventMetadata,
    ) -> Result<InstanceStatus> {
        let pending: Vec<PendingCompensation> = instance
            .compensation_plan()
            .into_iter()
            .map(|record| PendingCompensation {
                step_index: record.step_index,
                step_name: record.step_name.clone(),
                prior_result: record.result.clone().unwrap_or_default(),
            })
            .collect();

        tracing::info!(steps = pending.len(), "compensation started");

        for item in pending {
            let Some(registered) = definition.step_at(item.step_index) else {
                tracing::error!(step = %item.step_name, "step missing from definition; cannot compensate");
                let key = IdempotencyKey::for_compensation(instance_id, &item.step_name, 1);
                let event = compensation_failed(&item, 0, key, "step missing from definition".to_string());
                repo.commit(instance_id, instance, vec![event], metadata).await?;
                continue;
            };
            if !registered.spec.compensable {
                tracing::info!(step = %item.step_name, "step has no compensation; skipping");
                continue;
            }

            let key = IdempotencyKey::for_compensation(instance_id, &item.step_name, 1);
            let ctx = CompensationContext {
                instance_id,
                step_name: item.step_name.clone(),
                idempotency_key: key.clone(),
                context: instance.context().clone(),
                prior_result: item.prior_result.clone(),
            };

            let event = match self.compensate(registered.step.as_ref(), &ctx).await {
                Ok(attempts) => {
                    tracing::info!(step = %item.step_name, attempts, "step compensated");
                    WorkflowEvent::StepCompensated(StepCompensationData {
                        step_index: item.step_index,
                        step_name: item.step_name.clone(),
                        attempts,
                        idempotency_key: key,
                        error: None,
                        finished_at: chrono::Utc::now(),
                    })
                }
                Err((attempts, error)) => {
                    tracing::error!(step = %item.step_name, attempts, %error, "compensation failed");
                    compensation_failed(&item, attempts, key, error)
                }
            };
            repo.commit(instance_id, instance, vec![event], metadata).await?;
        }

        let intervention = instance.intervention_steps();
        let reason = instance
            .failure_reason()
            .unwrap_or("compensated")
            .to_string();
        let terminal = if intervention.is_empty() {
            WorkflowEvent::instance_failed(reason)
        } else {
            tracing::error!(steps = ?intervention, "instance needs manual intervention");
            WorkflowEvent::instance_compensation_failed(intervention, reason)
        };
        repo.commit(instance_id, instance, vec![terminal], metadata).await?;
        Ok(instance.status())
    }

    /// Calls `compensate` with bounded retries on transient errors.
    async fn compensate(
        &self,
        step: &dyn Step,
        ctx: &CompensationContext,
    ) -> std::result::Result<u32, (u32, String)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match step.compensate(ctx).await {
                Ok(()) => return Ok(attempts),
                Err(err) if err.is_transient() && self.retry.should_retry(attempts) => {
                    let delay = self.retry.delay_for(attempts);
                    tracing::warn!(step = %ctx.step_name, attempts, error = %err, "retrying compensation");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err((attempts, err.to_string())),
            }
        }
    }
}

fn compensation_failed(
    item: &PendingCompensation,
    attempts: u32,
    key: IdempotencyKey,
    error: String,
) -> WorkflowEvent {
    WorkflowEvent::StepCompensationFailed(StepCompensationData {
        step_index: item.step_index,
        step_name: item.step_name.clone(),
        attempts,
        idempotency_key: key,
        error: Some(error),
        finished_at: chrono::Utc::now(),
    })
}
