//! The step contract: a forward action plus an optional compensation.

use async_trait::async_trait;
use common::{AggregateId, CorrelationId, IdempotencyKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque key-value payload carried by an instance and extended by each step.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

/// Whether a step can be safely re-invoked with the same idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    /// Re-invocation with a used key returns the prior result without
    /// repeating the side effect.
    #[default]
    Idempotent,

    /// The collaborator cannot dedupe; the executor consults the dedupe ledger
    /// and never retries blindly.
    RequiresDedupe,
}

/// Everything a forward action may read.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: AggregateId,
    pub step_name: String,
    /// Physical try number, starting at 1.
    pub attempt: u32,
    /// Stable across retries and crash re-drives of the same step.
    pub idempotency_key: IdempotencyKey,
    /// The accumulated instance context.
    pub context: ContextMap,
}

impl StepContext {
    /// Reads a string field from the context.
    pub fn str_field(&self, key: &str) -> Result<&str, StepError> {
        self.context
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| StepError::Permanent(format!("context field '{key}' is missing")))
    }

    /// Reads an integer field from the context.
    pub fn i64_field(&self, key: &str) -> Result<i64, StepError> {
        self.context
            .get(key)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| StepError::Permanent(format!("context field '{key}' is missing")))
    }
}

/// Everything a compensation may read.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    pub instance_id: AggregateId,
    pub step_name: String,
    pub idempotency_key: IdempotencyKey,
    /// The instance context at the time compensation started.
    pub context: ContextMap,
    /// The fields the forward action produced.
    pub prior_result: ContextMap,
}

impl CompensationContext {
    /// Reads a string field from the forward result, falling back to the context.
    pub fn str_field(&self, key: &str) -> Result<&str, StepError> {
        self.prior_result
            .get(key)
            .or_else(|| self.context.get(key))
            .and_then(|v| v.as_str())
            .ok_or_else(|| StepError::Permanent(format!("field '{key}' is missing")))
    }
}

/// What a forward action returned.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// The step finished; `fields` are merged into the context.
    Completed { fields: ContextMap },

    /// The step handed `correlation_id` to an external system and will be
    /// resumed by its callback.
    Parked {
        fields: ContextMap,
        correlation_id: CorrelationId,
    },
}

impl StepOutput {
    pub fn completed(fields: ContextMap) -> Self {
        StepOutput::Completed { fields }
    }

    pub fn parked(correlation_id: CorrelationId, fields: ContextMap) -> Self {
        StepOutput::Parked {
            fields,
            correlation_id,
        }
    }
}

/// Failure classification reported by a step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Network errors, 5xx, timeouts: retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Validation or business rejection: fails the step immediately.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The external effect may or may not have happened and cannot be
    /// checked automatically.
    #[error("reconciliation required: {0}")]
    ReconciliationRequired(String),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::Transient(_) => FailureKind::Transient,
            StepError::Permanent(_) => FailureKind::Permanent,
            StepError::ReconciliationRequired(_) => FailureKind::ReconciliationRequired,
        }
    }
}

/// Persisted classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    ReconciliationRequired,
    TimedOut,
    Cancelled,
}

/// A unit of work in a workflow.
///
/// Both methods must be safe to call more than once with the same
/// idempotency key.
#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError>;

    async fn compensate(&self, _ctx: &CompensationContext) -> Result<(), StepError> {
        Ok(())
    }
}

/// Builds a [`ContextMap`] from `key => value` pairs.
#[macro_export]
macro_rules! fields {
    () => { $crate::step::ContextMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::step::ContextMap::new();
        $( map.insert(($key).to_string(), ::serde_json::json!($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(context: ContextMap) -> StepContext {
        let instance_id = AggregateId::new();
        StepContext {
            instance_id,
            step_name: "assess_credit".to_string(),
            attempt: 1,
            idempotency_key: IdempotencyKey::derive(instance_id, "assess_credit", 1),
            context,
        }
    }

    #[test]
    fn missing_context_field_is_permanent() {
        let ctx = ctx(fields! { "invoice_id" => "INV-1" });
        assert_eq!(ctx.str_field("invoice_id").unwrap(), "INV-1");
        assert!(matches!(
            ctx.i64_field("amount_cents"),
            Err(StepError::Permanent(_))
        ));
    }

    #[test]
    fn compensation_prefers_prior_result() {
        let instance_id = AggregateId::new();
        let ctx = CompensationContext {
            instance_id,
            step_name: "lock_invoice".to_string(),
            idempotency_key: IdempotencyKey::for_compensation(instance_id, "lock_invoice", 1),
            context: fields! { "lock_id" => "from-context", "invoice_id" => "INV-1" },
            prior_result: fields! { "lock_id" => "from-result" },
        };
        assert_eq!(ctx.str_field("lock_id").unwrap(), "from-result");
        assert_eq!(ctx.str_field("invoice_id").unwrap(), "INV-1");
    }

    #[test]
    fn error_classification() {
        assert!(StepError::Transient("503".into()).is_transient());
        assert!(!StepError::Permanent("rejected".into()).is_transient());
        assert_eq!(
            StepError::ReconciliationRequired("?".into()).kind(),
            FailureKind::ReconciliationRequired
        );
    }
}
