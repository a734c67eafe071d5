//! Credit bureau: assesses the seller's exposure for an invoice amount.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::IdempotencyKey;

use super::{ActivityLog, ServiceError, take_failure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditDecision {
    pub assessment_id: String,
    pub limit_cents: i64,
}

#[async_trait]
pub trait CreditBureau: Send + Sync {
    /// Reserves `amount_cents` of credit exposure.
    async fn assess(
        &self,
        invoice_id: &str,
        amount_cents: i64,
        key: &IdempotencyKey,
    ) -> Result<CreditDecision, ServiceError>;

    /// Releases the exposure reserved by an assessment.
    async fn release(&self, assessment_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug)]
struct BureauState {
    limit_cents: i64,
    assessments: HashMap<IdempotencyKey, CreditDecision>,
    next_id: u32,
    transient_failures: u32,
    calls: u32,
}

/// Approves any amount up to a fixed limit.
#[derive(Debug, Clone)]
pub struct InMemoryCreditBureau {
    state: Arc<RwLock<BureauState>>,
    activity: ActivityLog,
}

impl InMemoryCreditBureau {
    pub fn new(limit_cents: i64, activity: ActivityLog) -> Self {
        Self {
            state: Arc::new(RwLock::new(BureauState {
                limit_cents,
                assessments: HashMap::new(),
                next_id: 0,
                transient_failures: 0,
                calls: 0,
            })),
            activity,
        }
    }

    /// Makes the next `n` assess calls fail as unavailable.
    pub fn fail_next(&self, n: u32) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).transient_failures = n;
    }

    pub fn calls(&self) -> u32 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).calls
    }

    pub fn open_assessments(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .assessments
            .len()
    }
}

#[async_trait]
impl CreditBureau for InMemoryCreditBureau {
    async fn assess(
        &self,
        invoice_id: &str,
        amount_cents: i64,
        key: &IdempotencyKey,
    ) -> Result<CreditDecision, ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.calls += 1;
        if take_failure(&mut state.transient_failures) {
            return Err(ServiceError::Unavailable("credit bureau returned 503".into()));
        }
        if let Some(decision) = state.assessments.get(key) {
            return Ok(decision.clone());
        }
        if amount_cents > state.limit_cents {
            return Err(ServiceError::Rejected(format!(
                "{invoice_id}: {amount_cents} exceeds credit limit {}",
                state.limit_cents
            )));
        }

        state.next_id += 1;
        let decision = CreditDecision {
            assessment_id: format!("CRD-{:04}", state.next_id),
            limit_cents: state.limit_cents,
        };
        state.assessments.insert(key.clone(), decision.clone());
        self.activity.record("assess");
        Ok(decision)
    }

    async fn release(&self, assessment_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.assessments.len();
        state
            .assessments
            .retain(|_, decision| decision.assessment_id != assessment_id);
        if state.assessments.len() < before {
            self.activity.record("release_credit");
        }
        Ok(())
    }
}
