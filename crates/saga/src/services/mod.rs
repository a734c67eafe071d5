//! External collaborators of the invoice-financing workflow and their
//! in-memory implementations.
//!
//! Each in-memory service records what it did in a shared [`ActivityLog`], so
//! tests can check both which effects happened and in what order.

pub mod credit;
pub mod invoices;
pub mod lenders;
pub mod payments;

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::step::StepError;

pub use credit::{CreditBureau, CreditDecision, InMemoryCreditBureau};
pub use invoices::{InMemoryInvoiceRegistry, InvoiceRegistry};
pub use lenders::{Acceptance, InMemoryLenderNetwork, LenderNetwork, OfferRequest};
pub use payments::{Disbursement, InMemoryPaymentRail, PaymentRail};

/// Error returned by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service could not be reached or answered with a 5xx.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service understood the request and refused it.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<ServiceError> for StepError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(msg) => StepError::Transient(msg),
            ServiceError::Rejected(msg) => StepError::Permanent(msg),
        }
    }
}

/// Ordered record of the side effects performed by in-memory services.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries that match any of `names`, in order.
    pub fn only(&self, names: &[&str]) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| names.contains(&e.as_str()))
            .collect()
    }
}

/// Counts down injected transient failures.
fn take_failure(remaining: &mut u32) -> bool {
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}
