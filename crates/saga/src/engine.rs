//! The workflow engine: starts, advances, parks, resumes, cancels and
//! recovers instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use domain::{Aggregate, AggregateRepository, EventMetadata};
use event_store::{EventStore, TRIGGER_KEY, Version};
use serde::Serialize;

use crate::aggregate::{ParkedWait, StepExecutionRecord, WorkflowInstance};
use crate::compensation::CompensationCoordinator;
use crate::definition::{DefinitionRegistry, WorkflowDefinition};
use crate::error::{Result, SagaError};
use crate::events::{StepResumedData, WaitTimedOutData, WorkflowEvent};
use crate::executor::{StepExecutor, StepOutcome};
use crate::ledger::DedupeLedger;
use crate::notify::{NoopPublisher, Notification, NotificationPublisher, Topic};
use crate::retry::RetryPolicy;
use crate::state::InstanceStatus;
use crate::step::ContextMap;
use crate::wait::{WaitRegistry, WaitToken};

/// Engine settings. Passed at construction; there is no global state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry policy for forward steps.
    pub retry: RetryPolicy,
    /// Retry policy for transient compensation errors.
    pub compensation_retry: RetryPolicy,
    pub sweeper_interval: Duration,
    pub sweeper_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::default(),
            sweeper_interval: Duration::from_secs(1),
            sweeper_batch_size: 100,
        }
    }
}

/// Returned by `start`, `resume` and `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    pub instance_id: AggregateId,
    pub status: InstanceStatus,
}

/// Audit view of an instance: current state plus the ordered history.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub instance_id: AggregateId,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub current_step_index: usize,
    pub version: Version,
    pub context: ContextMap,
    pub awaiting: Option<ParkedWait>,
    pub failure_reason: Option<String>,
    pub failed_steps: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub history: Vec<StepExecutionRecord>,
}

impl InstanceView {
    fn new(instance_id: AggregateId, instance: &WorkflowInstance) -> Self {
        Self {
            instance_id,
            definition_id: instance.definition_id().to_string(),
            definition_version: instance.definition_version(),
            status: instance.status(),
            current_step_index: instance.current_step_index(),
            version: instance.version(),
            context: instance.context().clone(),
            awaiting: instance.awaiting().cloned(),
            failure_reason: instance.failure_reason().map(str::to_string),
            failed_steps: instance.failed_steps().to_vec(),
            created_at: instance.created_at(),
            updated_at: instance.updated_at(),
            history: instance.records().to_vec(),
        }
    }
}

/// What `recover` found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub redriven: usize,
    pub tokens_restored: usize,
    pub timeouts_fired: usize,
    pub errors: usize,
}

fn trigger(name: &str) -> EventMetadata {
    EventMetadata::from([(TRIGGER_KEY.to_string(), serde_json::json!(name))])
}

/// Orchestrates workflow instances over an event-sourced log.
///
/// Any number of engines (or tasks sharing one engine) may work on the same
/// log. Every write is checked against the version the writer loaded; the
/// loser of a race gets `StaleVersion`, drops its work and reloads.
pub struct WorkflowEngine<S>
where
    S: EventStore,
{
    repo: AggregateRepository<S, WorkflowInstance>,
    definitions: Arc<DefinitionRegistry>,
    waits: Arc<dyn WaitRegistry>,
    executor: StepExecutor,
    compensator: CompensationCoordinator,
    publisher: Arc<dyn NotificationPublisher>,
    config: EngineConfig,
}

impl<S> WorkflowEngine<S>
where
    S: EventStore + Clone,
{
    pub fn new(
        store: S,
        definitions: Arc<DefinitionRegistry>,
        waits: Arc<dyn WaitRegistry>,
        ledger: Arc<dyn DedupeLedger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo: AggregateRepository::new(store),
            definitions,
            executor: StepExecutor::new(config.retry, ledger, waits.clone()),
            compensator: CompensationCoordinator::new(config.compensation_retry),
            waits,
            publisher: Arc::new(NoopPublisher),
            config,
        }
    }

    /// Replaces the notification publisher.
    pub fn with_publisher(mut self, publisher: Arc<dyn NotificationPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn store(&self) -> &S {
        self.repo.store()
    }

    /// Number of instances parked on a callback.
    pub async fn pending_waits(&self) -> Result<usize> {
        self.waits.pending_count().await
    }

    /// Creates an instance of the latest version of `definition_id` and drives
    /// it until it parks or reaches a terminal state.
    #[tracing::instrument(skip(self, context))]
    pub async fn start(&self, definition_id: &str, context: ContextMap) -> Result<InstanceSummary> {
        let definition = self.definitions.require_latest(definition_id)?;
        let instance_id = AggregateId::new();
        let mut instance = WorkflowInstance::default();

        self.repo
            .commit(
                instance_id,
                &mut instance,
                vec![WorkflowEvent::instance_started(
                    instance_id,
                    definition.id(),
                    definition.version(),
                    context,
                )],
                &trigger("start"),
            )
            .await?;
        metrics::counter!("workflow_instances_started_total", "definition" => definition.id().to_string())
            .increment(1);
        tracing::info!(%instance_id, version = definition.version(), "instance started");

        let instance = self.drive(instance_id, instance, "start").await?;
        Ok(InstanceSummary {
            instance_id,
            status: instance.status(),
        })
    }

    /// Delivers an external callback to the instance parked on `correlation_id`.
    ///
    /// Fails with `UnknownCorrelation` when no open token matches (including a
    /// token that was already consumed), `ExpiredToken` when its deadline has
    /// passed, and `StaleVersion` when a timeout or another resume won the race.
    /// The instance is left untouched in all three cases.
    #[tracing::instrument(skip(self, correlation_id, payload), fields(correlation_id = %correlation_id))]
    pub async fn resume(
        &self,
        correlation_id: &CorrelationId,
        payload: ContextMap,
    ) -> Result<InstanceSummary> {
        let token = self
            .waits
            .find(correlation_id)
            .await?
            .ok_or_else(|| SagaError::UnknownCorrelation(correlation_id.clone()))?;
        let now = Utc::now();
        if token.is_expired(now) {
            return Err(SagaError::ExpiredToken(correlation_id.clone()));
        }

        let instance_id = token.instance_id;
        let mut instance = self
            .repo
            .load(instance_id)
            .await?
            .ok_or_else(|| SagaError::UnknownCorrelation(correlation_id.clone()))?;
        let Some(wait) = instance
            .awaiting()
            .filter(|_| instance.is_awaiting(correlation_id))
            .cloned()
        else {
            return Err(SagaError::UnknownCorrelation(correlation_id.clone()));
        };

        let resumed = WorkflowEvent::StepResumed(StepResumedData {
            step_index: wait.step_index,
            step_name: wait.step_name.clone(),
            correlation_id: correlation_id.clone(),
            payload: payload.clone(),
            resumed_at: now,
        });
        if let Err(err) = self
            .repo
            .commit(instance_id, &mut instance, vec![resumed], &trigger("resume"))
            .await
        {
            let err = SagaError::from(err);
            if err.is_stale() {
                metrics::counter!("workflow_stale_writes_total", "trigger" => "resume").increment(1);
            }
            return Err(err);
        }
        self.release_token(instance_id, correlation_id).await;

        tracing::info!(%instance_id, step = %wait.step_name, "instance resumed");
        self.publish(
            Topic::StepSucceeded,
            instance_id,
            Some(wait.step_name.as_str()),
            serde_json::Value::Object(payload),
        );

        let instance = self.drive(instance_id, instance, "resume").await?;
        Ok(InstanceSummary {
            instance_id,
            status: instance.status(),
        })
    }

    /// Cancels a RUNNING or AWAITING_EVENT instance and compensates the steps
    /// completed so far.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(
        &self,
        instance_id: AggregateId,
        reason: Option<String>,
    ) -> Result<InstanceSummary> {
        let mut instance = self.repo.load(instance_id).await?.unwrap_or_default();
        let parked = instance.awaiting().map(|w| w.correlation_id.clone());
        let events = instance.request_cancel(instance_id, reason)?;
        self.repo
            .commit(instance_id, &mut instance, events, &trigger("cancel"))
            .await?;

        if let Some(correlation_id) = parked {
            self.release_token(instance_id, &correlation_id).await;
        }
        tracing::info!(%instance_id, "instance cancelled");

        let instance = self.drive(instance_id, instance, "cancel").await?;
        Ok(InstanceSummary {
            instance_id,
            status: instance.status(),
        })
    }

    /// Deletes the token of a wait the log already shows as settled.
    ///
    /// A failed delete leaves an orphan that no longer matches an awaiting
    /// instance; resume rejects it and the sweeper discards it once due.
    async fn release_token(&self, instance_id: AggregateId, correlation_id: &CorrelationId) {
        if let Err(err) = self.waits.take(correlation_id).await {
            tracing::warn!(
                %instance_id,
                %correlation_id,
                error = %err,
                "could not delete settled wait token"
            );
        }
    }

    /// Fires the timeouts of up to `limit` tokens whose deadline is at or before `now`.
    ///
    /// Each token is deleted before its instance is touched, so no token fires
    /// twice. Returns the number of instances moved to compensation.
    pub async fn fire_due_timeouts(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let due = self.waits.due(now, limit).await?;
        let mut fired = 0;

        for candidate in due {
            let Some(token) = self.waits.take(&candidate.correlation_id).await? else {
                continue;
            };
            match self.fire_timeout(token, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(
                        correlation_id = %candidate.correlation_id,
                        instance_id = %candidate.instance_id,
                        error = %err,
                        "failed to fire timeout"
                    );
                }
            }
        }
        Ok(fired)
    }

    async fn fire_timeout(&self, token: WaitToken, now: DateTime<Utc>) -> Result<bool> {
        let instance_id = token.instance_id;
        let Some(mut instance) = self.repo.load(instance_id).await? else {
            return Ok(false);
        };
        let Some(wait) = instance
            .awaiting()
            .filter(|_| instance.is_awaiting(&token.correlation_id))
            .cloned()
        else {
            tracing::debug!(%instance_id, correlation_id = %token.correlation_id, "stale wait token discarded");
            return Ok(false);
        };

        let timed_out = WorkflowEvent::WaitTimedOut(WaitTimedOutData {
            step_index: wait.step_index,
            step_name: wait.step_name.clone(),
            correlation_id: token.correlation_id.clone(),
            expired_at: wait.expires_at,
            fired_at: now,
        });
        match self
            .repo
            .commit(instance_id, &mut instance, vec![timed_out], &trigger("timeout"))
            .await
            .map_err(SagaError::from)
        {
            Ok(_) => {}
            Err(err) if err.is_stale() => {
                metrics::counter!("workflow_stale_writes_total", "trigger" => "timeout").increment(1);
                tracing::info!(%instance_id, "timeout lost the race; discarded");
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        metrics::counter!("workflow_timeouts_fired_total").increment(1);
        tracing::warn!(%instance_id, step = %wait.step_name, "wait timed out");
        self.publish(
            Topic::StepFailed,
            instance_id,
            Some(wait.step_name.as_str()),
            serde_json::json!({ "error": "wait timed out" }),
        );
        self.drive(instance_id, instance, "timeout").await?;
        Ok(true)
    }

    /// Re-drives every non-terminal instance found in the log.
    ///
    /// Run once at process start. RUNNING and COMPENSATING instances are driven
    /// from their last persisted state; steps whose record already shows
    /// SUCCEEDED are never executed again. AWAITING_EVENT instances whose token
    /// is missing get it back, or have their timeout fired if it has passed.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let ids = self
            .repo
            .store()
            .stream_ids(WorkflowInstance::aggregate_type())
            .await?;
        let mut report = RecoveryReport::default();

        for instance_id in ids {
            report.scanned += 1;
            if let Err(err) = self.recover_one(instance_id, &mut report).await {
                report.errors += 1;
                tracing::error!(%instance_id, error = %err, "recovery failed for instance");
            }
        }

        tracing::info!(
            scanned = report.scanned,
            redriven = report.redriven,
            tokens_restored = report.tokens_restored,
            timeouts_fired = report.timeouts_fired,
            errors = report.errors,
            "recovery finished"
        );
        Ok(report)
    }

    async fn recover_one(&self, instance_id: AggregateId, report: &mut RecoveryReport) -> Result<()> {
        let Some(instance) = self.repo.load(instance_id).await? else {
            return Ok(());
        };

        match instance.status() {
            InstanceStatus::Running | InstanceStatus::Compensating => {
                tracing::info!(%instance_id, status = %instance.status(), "re-driving instance");
                self.drive(instance_id, instance, "recover").await?;
                report.redriven += 1;
            }
            InstanceStatus::AwaitingEvent => {
                let Some(wait) = instance.awaiting() else {
                    return Ok(());
                };
                if self.waits.find(&wait.correlation_id).await?.is_some() {
                    return Ok(());
                }
                let token = WaitToken::from_parked(instance_id, wait);
                let now = Utc::now();
                if token.is_expired(now) {
                    if self.fire_timeout(token, now).await? {
                        report.timeouts_fired += 1;
                    }
                } else {
                    self.waits.register(token).await?;
                    report.tokens_restored += 1;
                }
            }
            InstanceStatus::Completed
            | InstanceStatus::Failed
            | InstanceStatus::CompensationFailed => {}
        }
        Ok(())
    }

    /// Current state and full history of an instance.
    pub async fn get_instance(&self, instance_id: AggregateId) -> Result<InstanceView> {
        let instance = self
            .repo
            .load(instance_id)
            .await?
            .ok_or(SagaError::InstanceNotFound(instance_id))?;
        Ok(InstanceView::new(instance_id, &instance))
    }

    /// The instance exactly as it was once `version` was written.
    pub async fn instance_at(&self, instance_id: AggregateId, version: Version) -> Result<InstanceView> {
        let instance = self
            .repo
            .load_at(instance_id, version)
            .await?
            .ok_or(SagaError::InstanceNotFound(instance_id))?;
        Ok(InstanceView::new(instance_id, &instance))
    }

    /// Advances the instance until it parks, settles, or loses a race.
    ///
    /// On `StaleVersion` another writer owns the instance; its latest state is
    /// reloaded and returned without further work.
    async fn drive(
        &self,
        instance_id: AggregateId,
        mut instance: WorkflowInstance,
        trigger_name: &str,
    ) -> Result<WorkflowInstance> {
        let definition = self
            .definitions
            .require(instance.definition_id(), instance.definition_version())?;
        let metadata = trigger(trigger_name);

        loop {
            match self.advance(instance_id, &mut instance, &definition, &metadata).await {
                Ok(true) => continue,
                Ok(false) => return Ok(instance),
                Err(err) if err.is_stale() => {
                    metrics::counter!("workflow_stale_writes_total", "trigger" => trigger_name.to_string())
                        .increment(1);
                    tracing::info!(%instance_id, "instance advanced by another writer; yielding");
                    return self
                        .repo
                        .load(instance_id)
                        .await?
                        .ok_or(SagaError::InstanceNotFound(instance_id));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Takes one transition. Returns false once the instance is parked or
    /// terminal.
    async fn advance(
        &self,
        instance_id: AggregateId,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        metadata: &EventMetadata,
    ) -> Result<bool> {
        match instance.status() {
            InstanceStatus::Running if instance.current_step_index() >= definition.len() => {
                self.repo
                    .commit(instance_id, instance, vec![WorkflowEvent::instance_completed()], metadata)
                    .await?;
                metrics::counter!("workflow_instances_completed_total", "definition" => definition.id().to_string())
                    .increment(1);
                tracing::info!(%instance_id, "instance completed");
                self.publish(
                    Topic::InstanceCompleted,
                    instance_id,
                    None,
                    serde_json::Value::Object(instance.context().clone()),
                );
                Ok(false)
            }
            InstanceStatus::Running => {
                let outcome = self
                    .executor
                    .run(&self.repo, instance_id, instance, definition, metadata)
                    .await?;
                match outcome {
                    StepOutcome::Succeeded { step_name, fields } => {
                        self.publish(
                            Topic::StepSucceeded,
                            instance_id,
                            Some(step_name.as_str()),
                            serde_json::Value::Object(fields),
                        );
                        Ok(true)
                    }
                    StepOutcome::Parked { .. } => Ok(false),
                    StepOutcome::Failed { step_name, error } => {
                        self.publish(
                            Topic::StepFailed,
                            instance_id,
                            Some(step_name.as_str()),
                            serde_json::json!({ "error": error }),
                        );
                        Ok(true)
                    }
                }
            }
            InstanceStatus::Compensating => {
                let status = self
                    .compensator
                    .run(&self.repo, instance_id, instance, definition, metadata)
                    .await?;
                let reason = instance.failure_reason().unwrap_or_default();
                if status == InstanceStatus::CompensationFailed {
                    metrics::counter!("workflow_instances_compensation_failed_total", "definition" => definition.id().to_string())
                        .increment(1);
                    self.publish(
                        Topic::InstanceCompensationFailed,
                        instance_id,
                        None,
                        serde_json::json!({ "reason": reason, "failed_steps": instance.failed_steps() }),
                    );
                } else {
                    metrics::counter!("workflow_instances_failed_total", "definition" => definition.id().to_string())
                        .increment(1);
                    self.publish(
                        Topic::InstanceFailed,
                        instance_id,
                        None,
                        serde_json::json!({ "reason": reason }),
                    );
                }
                tracing::info!(%instance_id, %status, "instance finished compensation");
                Ok(false)
            }
            InstanceStatus::AwaitingEvent
            | InstanceStatus::Completed
            | InstanceStatus::Failed
            | InstanceStatus::CompensationFailed => Ok(false),
        }
    }

    fn publish(
        &self,
        topic: Topic,
        instance_id: AggregateId,
        step_name: Option<&str>,
        payload: serde_json::Value,
    ) {
        self.publisher
            .publish(Notification::new(topic, instance_id, step_name, payload));
    }
}
