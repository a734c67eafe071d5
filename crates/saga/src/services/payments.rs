//! Payment rail: moves the financed amount to the seller.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::IdempotencyKey;

use super::{ActivityLog, ServiceError, take_failure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disbursement {
    pub disbursement_id: String,
    pub amount_cents: i64,
}

#[async_trait]
pub trait PaymentRail: Send + Sync {
    /// Pays `amount_cents` to `account`. A repeated key returns the original
    /// disbursement without moving money again.
    async fn disburse(
        &self,
        account: &str,
        amount_cents: i64,
        key: &IdempotencyKey,
    ) -> Result<Disbursement, ServiceError>;

    /// Claws a disbursement back. Idempotent per key.
    async fn reverse(&self, disbursement_id: &str, key: &IdempotencyKey) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct RailState {
    disbursements: HashMap<IdempotencyKey, Disbursement>,
    reversals: HashMap<IdempotencyKey, String>,
    next_id: u32,
    calls: u32,
    lost_responses: u32,
    reject_reversals: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentRail {
    state: Arc<RwLock<RailState>>,
    activity: ActivityLog,
}

impl InMemoryPaymentRail {
    pub fn new(activity: ActivityLog) -> Self {
        Self {
            state: Arc::default(),
            activity,
        }
    }

    /// The next `n` disburse calls move the money but report a timeout.
    pub fn lose_next_responses(&self, n: u32) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).lost_responses = n;
    }

    /// Makes every reversal fail permanently.
    pub fn reject_reversals(&self, reject: bool) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).reject_reversals = reject;
    }

    /// Number of disburse calls received.
    pub fn calls(&self) -> u32 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).calls
    }

    /// Number of distinct disbursements made.
    pub fn effects(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .disbursements
            .len()
    }

    pub fn reversals(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reversals
            .len()
    }
}

#[async_trait]
impl PaymentRail for InMemoryPaymentRail {
    async fn disburse(
        &self,
        account: &str,
        amount_cents: i64,
        key: &IdempotencyKey,
    ) -> Result<Disbursement, ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.calls += 1;
        if amount_cents <= 0 {
            return Err(ServiceError::Rejected(format!("invalid amount {amount_cents}")));
        }

        let disbursement = match state.disbursements.get(key) {
            Some(existing) => existing.clone(),
            None => {
                state.next_id += 1;
                let disbursement = Disbursement {
                    disbursement_id: format!("DSB-{:04}", state.next_id),
                    amount_cents,
                };
                state.disbursements.insert(key.clone(), disbursement.clone());
                self.activity.record("disburse");
                tracing::debug!(%account, amount_cents, "funds disbursed");
                disbursement
            }
        };

        if take_failure(&mut state.lost_responses) {
            return Err(ServiceError::Unavailable("payment rail response lost".into()));
        }
        Ok(disbursement)
    }

    async fn reverse(&self, disbursement_id: &str, key: &IdempotencyKey) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.reject_reversals {
            return Err(ServiceError::Rejected(format!(
                "{disbursement_id} already settled; cannot reverse"
            )));
        }
        if !state.reversals.contains_key(key) {
            state.reversals.insert(key.clone(), disbursement_id.to_string());
            self.activity.record("reverse");
        }
        Ok(())
    }
}
