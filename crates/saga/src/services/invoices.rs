//! Invoice registry: locks an invoice so it cannot be financed twice.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::IdempotencyKey;

use super::{ActivityLog, ServiceError, take_failure};

#[async_trait]
pub trait InvoiceRegistry: Send + Sync {
    /// Locks `invoice_id` and returns the lock id. Repeating the call with the
    /// same key returns the same lock.
    async fn lock(&self, invoice_id: &str, key: &IdempotencyKey) -> Result<String, ServiceError>;

    /// Releases a lock. Unknown locks are ignored.
    async fn unlock(&self, lock_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct RegistryState {
    /// invoice id -> (lock id, key that took it)
    locks: HashMap<String, (String, IdempotencyKey)>,
    next_id: u32,
    unlock_failures: u32,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryInvoiceRegistry {
    state: Arc<RwLock<RegistryState>>,
    activity: ActivityLog,
}

impl InMemoryInvoiceRegistry {
    pub fn new(activity: ActivityLog) -> Self {
        Self {
            state: Arc::default(),
            activity,
        }
    }

    /// Makes the next `n` unlock calls fail as unavailable.
    pub fn fail_next_unlocks(&self, n: u32) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).unlock_failures = n;
    }

    pub fn is_locked(&self, invoice_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .locks
            .contains_key(invoice_id)
    }
}

#[async_trait]
impl InvoiceRegistry for InMemoryInvoiceRegistry {
    async fn lock(&self, invoice_id: &str, key: &IdempotencyKey) -> Result<String, ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((lock_id, holder)) = state.locks.get(invoice_id) {
            return if holder == key {
                Ok(lock_id.clone())
            } else {
                Err(ServiceError::Rejected(format!("invoice {invoice_id} is already locked")))
            };
        }

        state.next_id += 1;
        let lock_id = format!("LOCK-{:04}", state.next_id);
        state
            .locks
            .insert(invoice_id.to_string(), (lock_id.clone(), key.clone()));
        self.activity.record("lock");
        Ok(lock_id)
    }

    async fn unlock(&self, lock_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if take_failure(&mut state.unlock_failures) {
            return Err(ServiceError::Unavailable("invoice registry timed out".into()));
        }
        let before = state.locks.len();
        state.locks.retain(|_, (id, _)| id != lock_id);
        if state.locks.len() < before {
            self.activity.record("unlock");
        }
        Ok(())
    }
}
