//! Step executor: runs the current forward step of an instance.
//!
//! Every physical try is bracketed by log writes: `StepAttemptStarted` before
//! the call and `StepSucceeded` / `StepFailed` / `StepParked` after it. A crash
//! in between leaves a dangling attempt that the next drive detects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, IdempotencyKey};
use domain::{AggregateRepository, EventMetadata};
use event_store::EventStore;

use crate::aggregate::WorkflowInstance;
use crate::definition::{RegisteredStep, WorkflowDefinition};
use crate::error::{Result, SagaError};
use crate::events::{StepParkedData, WorkflowEvent};
use crate::ledger::DedupeLedger;
use crate::retry::RetryPolicy;
use crate::state::StepStatus;
use crate::step::{ContextMap, FailureKind, Idempotency, StepContext, StepError, StepOutput};
use crate::wait::{WaitRegistry, WaitToken};

/// Schema version stamped on new wait tokens.
pub const RESUME_SCHEMA_VERSION: i32 = 1;

/// What happened to the step after the executor returned.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        step_name: String,
        fields: ContextMap,
    },
    Parked {
        step_name: String,
        correlation_id: CorrelationId,
        expires_at: DateTime<Utc>,
    },
    Failed {
        step_name: String,
        error: String,
    },
}

/// Where the current step's retry chain stands, read from the log.
struct ChainState {
    key: IdempotencyKey,
    next_attempt: u32,
    failures: u32,
    dangling: Option<u32>,
}

impl ChainState {
    fn read(instance: &WorkflowInstance, instance_id: AggregateId, index: usize, name: &str) -> Self {
        let attempts = instance.forward_attempts(index);
        let key = attempts
            .first()
            .map(|r| r.idempotency_key.clone())
            .unwrap_or_else(|| IdempotencyKey::derive(instance_id, name, 1));
        let last = attempts.last();
        Self {
            key,
            next_attempt: last.map_or(1, |r| r.attempt + 1),
            failures: attempts
                .iter()
                .filter(|r| r.status == StepStatus::Failed)
                .count() as u32,
            dangling: last
                .filter(|r| r.status == StepStatus::Running)
                .map(|r| r.attempt),
        }
    }
}

pub struct StepExecutor {
    retry: RetryPolicy,
    ledger: Arc<dyn DedupeLedger>,
    waits: Arc<dyn WaitRegistry>,
}

impl StepExecutor {
    pub fn new(
        retry: RetryPolicy,
        ledger: Arc<dyn DedupeLedger>,
        waits: Arc<dyn WaitRegistry>,
    ) -> Self {
        Self {
            retry,
            ledger,
            waits,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs the step at `instance.current_step_index()` until it succeeds,
    /// parks, or fails for good. Every transition is committed to the log and
    /// applied to `instance` before this returns.
    ///
    /// A stale write aborts the run with `StaleVersion`; the caller reloads.
    #[tracing::instrument(skip_all, fields(instance_id = %instance_id, step = tracing::field::Empty))]
    pub async fn run<S: EventStore>(
        &self,
        repo: &AggregateRepository<S, WorkflowInstance>,
        instance_id: AggregateId,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        metadata: &EventMetadata,
    ) -> Result<StepOutcome> {
        let index = instance.current_step_index();
        let registered = definition.step_at(index).ok_or_else(|| {
            SagaError::InvalidDefinition(format!(
                "{} v{} has no step at index {index}",
                definition.id(),
                definition.version()
            ))
        })?;
        let name = registered.spec.name.clone();
        tracing::Span::current().record("step", name.as_str());

        loop {
            let chain = ChainState::read(instance, instance_id, index, &name);

            if registered.spec.idempotency == Idempotency::RequiresDedupe {
                if let Some(fields) = self.ledger.get(&chain.key).await? {
                    tracing::info!(step = %name, "result found in dedupe ledger");
                    let mut events = Vec::new();
                    let attempt = match chain.dangling {
                        Some(attempt) => attempt,
                        None => {
                            events.push(WorkflowEvent::attempt_started(
                                index,
                                &name,
                                chain.next_attempt,
                                chain.key.clone(),
                            ));
                            chain.next_attempt
                        }
                    };
                    events.push(WorkflowEvent::step_succeeded(
                        index,
                        &name,
                        attempt,
                        fields.clone(),
                        true,
                    ));
                    repo.commit(instance_id, instance, events, metadata).await?;
                    return Ok(StepOutcome::Succeeded {
                        step_name: name,
                        fields,
                    });
                }

                if let Some(attempt) = chain.dangling {
                    let error = "attempt interrupted with unknown outcome";
                    tracing::error!(step = %name, attempt, "{error}; reconciliation required");
                    let error = StepError::ReconciliationRequired(error.to_string());
                    return self
                        .fail(repo, instance_id, instance, index, &name, attempt, error, false, metadata)
                        .await;
                }
            } else if let Some(attempt) = chain.dangling {
                // Interrupted attempts count against the retry budget.
                let will_retry = self.retry.should_retry(chain.failures + 1);
                tracing::warn!(step = %name, attempt, will_retry, "closing interrupted attempt");
                let error = StepError::Transient("attempt interrupted before completion".to_string());
                let outcome = self
                    .fail(repo, instance_id, instance, index, &name, attempt, error, will_retry, metadata)
                    .await?;
                if !will_retry {
                    return Ok(outcome);
                }
                continue;
            }

            let attempt = chain.next_attempt;
            repo.commit(
                instance_id,
                instance,
                vec![WorkflowEvent::attempt_started(index, &name, attempt, chain.key.clone())],
                metadata,
            )
            .await?;

            let ctx = StepContext {
                instance_id,
                step_name: name.clone(),
                attempt,
                idempotency_key: chain.key.clone(),
                context: instance.context().clone(),
            };

            tracing::info!(step = %name, attempt, key = %chain.key, "step attempt started");
            metrics::counter!("workflow_step_attempts_total", "step" => name.clone()).increment(1);
            let started = Instant::now();
            let result = registered.step.execute(&ctx).await;
            metrics::histogram!("workflow_step_duration_seconds", "step" => name.clone())
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok(StepOutput::Completed { fields }) => {
                    if registered.spec.idempotency == Idempotency::RequiresDedupe {
                        self.ledger
                            .record(&chain.key, instance_id, &name, &fields)
                            .await?;
                    }
                    repo.commit(
                        instance_id,
                        instance,
                        vec![WorkflowEvent::step_succeeded(index, &name, attempt, fields.clone(), false)],
                        metadata,
                    )
                    .await?;
                    tracing::info!(step = %name, attempt, "step succeeded");
                    return Ok(StepOutcome::Succeeded {
                        step_name: name,
                        fields,
                    });
                }
                Ok(StepOutput::Parked {
                    fields,
                    correlation_id,
                }) => {
                    return self
                        .park(repo, instance_id, instance, registered, index, attempt, correlation_id, fields, metadata)
                        .await;
                }
                Err(error) => {
                    let error = match error {
                        StepError::Transient(msg)
                            if registered.spec.idempotency == Idempotency::RequiresDedupe =>
                        {
                            StepError::ReconciliationRequired(msg)
                        }
                        other => other,
                    };
                    let will_retry =
                        error.is_transient() && self.retry.should_retry(chain.failures + 1);
                    let outcome = self
                        .fail(repo, instance_id, instance, index, &name, attempt, error, will_retry, metadata)
                        .await?;
                    if !will_retry {
                        return Ok(outcome);
                    }

                    let delay = self.retry.delay_for(chain.failures + 1);
                    metrics::counter!("workflow_step_retries_total", "step" => name.clone()).increment(1);
                    tracing::warn!(step = %name, attempt, delay_ms = delay.as_millis() as u64, "retrying step");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn park<S: EventStore>(
        &self,
        repo: &AggregateRepository<S, WorkflowInstance>,
        instance_id: AggregateId,
        instance: &mut WorkflowInstance,
        registered: &RegisteredStep,
        index: usize,
        attempt: u32,
        correlation_id: CorrelationId,
        fields: ContextMap,
        metadata: &EventMetadata,
    ) -> Result<StepOutcome> {
        let name = &registered.spec.name;
        let Some(timeout) = registered.spec.timeout.filter(|_| registered.spec.is_async) else {
            let error = StepError::Permanent("synchronous step tried to park".to_string());
            return self
                .fail(repo, instance_id, instance, index, name, attempt, error, false, metadata)
                .await;
        };

        let expires_at = deadline(Utc::now(), timeout);
        let token = WaitToken {
            correlation_id: correlation_id.clone(),
            instance_id,
            step_name: name.clone(),
            expires_at,
            resume_schema_version: RESUME_SCHEMA_VERSION,
        };
        // The token goes first so a callback arriving right after the park
        // commit always finds it.
        self.waits.register(token).await?;

        let parked = WorkflowEvent::StepParked(StepParkedData {
            step_index: index,
            step_name: name.clone(),
            attempt,
            correlation_id: correlation_id.clone(),
            expires_at,
            resume_schema_version: RESUME_SCHEMA_VERSION,
            fields,
        });
        repo.commit(instance_id, instance, vec![parked], metadata).await?;

        tracing::info!(step = %name, correlation_id = %correlation_id, %expires_at, "step parked");
        Ok(StepOutcome::Parked {
            step_name: name.clone(),
            correlation_id,
            expires_at,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail<S: EventStore>(
        &self,
        repo: &AggregateRepository<S, WorkflowInstance>,
        instance_id: AggregateId,
        instance: &mut WorkflowInstance,
        index: usize,
        name: &str,
        attempt: u32,
        error: StepError,
        will_retry: bool,
        metadata: &EventMetadata,
    ) -> Result<StepOutcome> {
        let message = error.to_string();
        let kind: FailureKind = error.kind();
        repo.commit(
            instance_id,
            instance,
            vec![WorkflowEvent::step_failed(index, name, attempt, kind, &message, will_retry)],
            metadata,
        )
        .await?;

        if will_retry {
            tracing::warn!(step = %name, attempt, error = %message, "step attempt failed");
        } else {
            tracing::info!(step = %name, attempt, error = %message, "step failed");
        }
        Ok(StepOutcome::Failed {
            step_name: name.to_string(),
            error: message,
        })
    }
}

/// `now + timeout`, saturating at the latest representable instant.
pub(crate) fn deadline(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use domain::Aggregate;
    use event_store::InMemoryEventStore;

    use super::*;
    use crate::definition::StepSpec;
    use crate::fields;
    use crate::ledger::InMemoryDedupeLedger;
    use crate::wait::InMemoryWaitRegistry;

    /// Fails transiently `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        keys: std::sync::Mutex<Vec<IdempotencyKey>>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                keys: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl crate::step::Step for Flaky {
        async fn execute(&self, ctx: &StepContext) -> std::result::Result<StepOutput, StepError> {
            self.keys.lock().unwrap().push(ctx.idempotency_key.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(StepError::Transient(format!("503 on call {call}")))
            } else {
                Ok(StepOutput::completed(fields! { "calls" => call }))
            }
        }
    }

    struct Parks;

    #[async_trait]
    impl crate::step::Step for Parks {
        async fn execute(&self, ctx: &StepContext) -> std::result::Result<StepOutput, StepError> {
            Ok(StepOutput::parked(
                CorrelationId::new(format!("cb-{}", ctx.idempotency_key)),
                fields! {},
            ))
        }
    }

    struct Harness {
        repo: AggregateRepository<InMemoryEventStore, WorkflowInstance>,
        waits: Arc<InMemoryWaitRegistry>,
        ledger: Arc<InMemoryDedupeLedger>,
        id: AggregateId,
        instance: WorkflowInstance,
    }

    impl Harness {
        async fn new() -> Self {
            let repo = AggregateRepository::new(InMemoryEventStore::new());
            let id = AggregateId::new();
            let mut instance = WorkflowInstance::default();
            repo.commit(
                id,
                &mut instance,
                vec![WorkflowEvent::instance_started(id, "test", 1, fields! {})],
                &EventMetadata::new(),
            )
            .await
            .unwrap();
            Self {
                repo,
                waits: Arc::new(InMemoryWaitRegistry::new()),
                ledger: Arc::new(InMemoryDedupeLedger::new()),
                id,
                instance,
            }
        }

        fn executor(&self, max_attempts: u32) -> StepExecutor {
            StepExecutor::new(
                RetryPolicy::immediate(max_attempts),
                self.ledger.clone(),
                self.waits.clone(),
            )
        }

        async fn run(&mut self, executor: &StepExecutor, def: &WorkflowDefinition) -> StepOutcome {
            executor
                .run(&self.repo, self.id, &mut self.instance, def, &EventMetadata::new())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_with_one_key() {
        let mut h = Harness::new().await;
        let step = Arc::new(Flaky::new(2));
        let def = WorkflowDefinition::new("test", 1).shared_step(StepSpec::new("flaky"), step.clone());

        let executor = h.executor(3);
        let outcome = h.run(&executor, &def).await;

        assert!(matches!(outcome, StepOutcome::Succeeded { .. }));
        assert_eq!(step.calls.load(Ordering::SeqCst), 3);
        let keys = step.keys.lock().unwrap();
        assert!(keys.iter().all(|k| k == &keys[0]));
        assert_eq!(keys[0], IdempotencyKey::derive(h.id, "flaky", 1));

        let attempts = h.instance.forward_attempts(0);
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(h.instance.current_step_index(), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let mut h = Harness::new().await;
        let step = Arc::new(Flaky::new(10));
        let def = WorkflowDefinition::new("test", 1).shared_step(StepSpec::new("flaky"), step.clone());

        let executor = h.executor(3);
        let outcome = h.run(&executor, &def).await;

        assert!(matches!(outcome, StepOutcome::Failed { ref step_name, .. } if step_name == "flaky"));
        assert_eq!(step.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.instance.status(), crate::state::InstanceStatus::Compensating);
    }

    #[tokio::test]
    async fn dedupe_step_is_never_retried() {
        let mut h = Harness::new().await;
        let step = Arc::new(Flaky::new(1));
        let def = WorkflowDefinition::new("test", 1)
            .shared_step(StepSpec::new("accept").requires_dedupe(), step.clone());

        let executor = h.executor(3);
        let outcome = h.run(&executor, &def).await;

        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.instance.intervention_steps(), vec!["accept"]);
    }

    #[tokio::test]
    async fn dangling_dedupe_attempt_uses_the_ledger() {
        let mut h = Harness::new().await;
        let key = IdempotencyKey::derive(h.id, "accept", 1);
        h.repo
            .commit(
                h.id,
                &mut h.instance,
                vec![WorkflowEvent::attempt_started(0, "accept", 1, key.clone())],
                &EventMetadata::new(),
            )
            .await
            .unwrap();
        h.ledger
            .record(&key, h.id, "accept", &fields! { "acceptance_id" => "ACC-1" })
            .await
            .unwrap();

        let step = Arc::new(Flaky::new(0));
        let def = WorkflowDefinition::new("test", 1)
            .shared_step(StepSpec::new("accept").requires_dedupe(), step.clone());
        let executor = h.executor(3);
        let outcome = h.run(&executor, &def).await;

        assert!(matches!(outcome, StepOutcome::Succeeded { ref fields, .. } if fields["acceptance_id"] == "ACC-1"));
        assert_eq!(step.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.instance.forward_attempts(0).len(), 1);
    }

    #[tokio::test]
    async fn dangling_dedupe_attempt_without_ledger_needs_reconciliation() {
        let mut h = Harness::new().await;
        let key = IdempotencyKey::derive(h.id, "accept", 1);
        h.repo
            .commit(
                h.id,
                &mut h.instance,
                vec![WorkflowEvent::attempt_started(0, "accept", 1, key)],
                &EventMetadata::new(),
            )
            .await
            .unwrap();

        let step = Arc::new(Flaky::new(0));
        let def = WorkflowDefinition::new("test", 1)
            .shared_step(StepSpec::new("accept").requires_dedupe(), step.clone());
        let executor = h.executor(3);
        let outcome = h.run(&executor, &def).await;

        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        assert_eq!(step.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.instance.intervention_steps(), vec!["accept"]);
    }

    #[tokio::test]
    async fn interrupted_idempotent_attempt_is_retried_with_same_key() {
        let mut h = Harness::new().await;
        let key = IdempotencyKey::derive(h.id, "flaky", 1);
        h.repo
            .commit(
                h.id,
                &mut h.instance,
                vec![WorkflowEvent::attempt_started(0, "flaky", 1, key.clone())],
                &EventMetadata::new(),
            )
            .await
            .unwrap();

        let step = Arc::new(Flaky::new(0));
        let def = WorkflowDefinition::new("test", 1).shared_step(StepSpec::new("flaky"), step.clone());
        let executor = h.executor(3);
        h.run(&executor, &def).await;

        assert_eq!(step.keys.lock().unwrap().as_slice(), [key]);
        let attempts = h.instance.forward_attempts(0);
        assert_eq!(attempts[0].status, StepStatus::Failed);
        assert_eq!(attempts[1].status, StepStatus::Succeeded);
        assert_eq!(attempts[1].attempt, 2);
    }

    #[tokio::test]
    async fn async_step_parks_and_registers_token() {
        let mut h = Harness::new().await;
        let def = WorkflowDefinition::new("test", 1).step(
            StepSpec::new("offers").awaits_callback(Duration::from_secs(60)),
            Parks,
        );

        let executor = h.executor(3);
        let outcome = h.run(&executor, &def).await;

        let StepOutcome::Parked { correlation_id, .. } = outcome else {
            panic!("expected park, got {outcome:?}");
        };
        assert!(h.instance.is_awaiting(&correlation_id));
        let token = h.waits.find(&correlation_id).await.unwrap().unwrap();
        assert_eq!(token.instance_id, h.id);
        assert_eq!(token.step_name, "offers");
        assert_eq!(h.instance.version(), event_store::Version::new(3));
    }

    #[tokio::test]
    async fn sync_step_cannot_park() {
        let mut h = Harness::new().await;
        let def = WorkflowDefinition::new("test", 1).step(StepSpec::new("offers"), Parks);

        let executor = h.executor(3);
        let outcome = h.run(&executor, &def).await;

        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        assert_eq!(h.waits.pending_count().await.unwrap(), 0);
    }

    #[test]
    fn deadline_saturates() {
        let now = Utc::now();
        assert_eq!(deadline(now, Duration::from_secs(5)), now + chrono::Duration::seconds(5));
        assert_eq!(deadline(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
