//! Lender network: collects financing offers and books the accepted one.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{CorrelationId, IdempotencyKey};

use super::{ActivityLog, ServiceError};

/// An open call for offers. Lenders answer asynchronously, quoting
/// `correlation_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferRequest {
    pub request_id: String,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub acceptance_id: String,
}

#[async_trait]
pub trait LenderNetwork: Send + Sync {
    /// Broadcasts a call for offers. Idempotent per key.
    async fn request_offers(
        &self,
        invoice_id: &str,
        amount_cents: i64,
        key: &IdempotencyKey,
    ) -> Result<OfferRequest, ServiceError>;

    async fn withdraw(&self, request_id: &str) -> Result<(), ServiceError>;

    /// Books an offer. Not idempotent: every call books again.
    async fn accept(&self, offer_id: &str) -> Result<Acceptance, ServiceError>;

    async fn release(&self, acceptance_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct NetworkState {
    requests: HashMap<IdempotencyKey, OfferRequest>,
    acceptances: Vec<String>,
    next_id: u32,
    accept_calls: u32,
    lose_accept_responses: u32,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLenderNetwork {
    state: Arc<RwLock<NetworkState>>,
    activity: ActivityLog,
}

impl InMemoryLenderNetwork {
    pub fn new(activity: ActivityLog) -> Self {
        Self {
            state: Arc::default(),
            activity,
        }
    }

    /// The next `n` accepts book the offer but report a timeout.
    pub fn lose_next_accept_responses(&self, n: u32) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).lose_accept_responses = n;
    }

    pub fn accept_calls(&self) -> u32 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).accept_calls
    }

    pub fn acceptances(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .acceptances
            .len()
    }

    pub fn open_requests(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .len()
    }
}

#[async_trait]
impl LenderNetwork for InMemoryLenderNetwork {
    async fn request_offers(
        &self,
        invoice_id: &str,
        _amount_cents: i64,
        key: &IdempotencyKey,
    ) -> Result<OfferRequest, ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(request) = state.requests.get(key) {
            return Ok(request.clone());
        }

        state.next_id += 1;
        let request = OfferRequest {
            request_id: format!("REQ-{:04}", state.next_id),
            correlation_id: CorrelationId::new(format!("offers:{invoice_id}:{key}")),
        };
        state.requests.insert(key.clone(), request.clone());
        self.activity.record("request_offers");
        Ok(request)
    }

    async fn withdraw(&self, request_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.requests.len();
        state.requests.retain(|_, r| r.request_id != request_id);
        if state.requests.len() < before {
            self.activity.record("withdraw_offers");
        }
        Ok(())
    }

    async fn accept(&self, offer_id: &str) -> Result<Acceptance, ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.accept_calls += 1;
        if offer_id.is_empty() {
            return Err(ServiceError::Rejected("no offer selected".into()));
        }

        state.next_id += 1;
        let acceptance_id = format!("ACC-{:04}", state.next_id);
        state.acceptances.push(acceptance_id.clone());
        self.activity.record("accept");

        if super::take_failure(&mut state.lose_accept_responses) {
            return Err(ServiceError::Unavailable("lender gateway timed out".into()));
        }
        Ok(Acceptance { acceptance_id })
    }

    async fn release(&self, acceptance_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.acceptances.len();
        state.acceptances.retain(|id| id != acceptance_id);
        if state.acceptances.len() < before {
            self.activity.record("release_acceptance");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;

    #[tokio::test]
    async fn offer_requests_are_idempotent_but_acceptances_are_not() {
        let network = InMemoryLenderNetwork::new(ActivityLog::new());
        let key = IdempotencyKey::derive(AggregateId::new(), "request_offers", 1);

        let a = network.request_offers("INV-1", 100, &key).await.unwrap();
        let b = network.request_offers("INV-1", 100, &key).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(network.open_requests(), 1);

        network.accept("OFFER-1").await.unwrap();
        network.accept("OFFER-1").await.unwrap();
        assert_eq!(network.acceptances(), 2);
    }
}
