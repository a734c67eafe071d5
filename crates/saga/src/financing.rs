//! Reference workflow: invoice financing.
//!
//! ```text
//! lock_invoice -> assess_credit -> request_offers (async) -> accept_offer -> disburse_funds
//! ```
//!
//! The instance context starts with `invoice_id`, `amount_cents` and
//! `seller_account`. The lender callback for `request_offers` carries the
//! selected `offer_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::definition::{StepSpec, WorkflowDefinition};
use crate::fields;
use crate::services::{
    ActivityLog, CreditBureau, InMemoryCreditBureau, InMemoryInvoiceRegistry,
    InMemoryLenderNetwork, InMemoryPaymentRail, InvoiceRegistry, LenderNetwork, PaymentRail,
};
use crate::step::{CompensationContext, Step, StepContext, StepError, StepOutput};

/// The workflow definition identifier.
pub const DEFINITION_ID: &str = "invoice-financing";

/// Current definition version.
pub const DEFINITION_VERSION: u32 = 1;

/// Step name: lock the invoice against double financing.
pub const STEP_LOCK_INVOICE: &str = "lock_invoice";

/// Step name: reserve credit exposure for the seller.
pub const STEP_ASSESS_CREDIT: &str = "assess_credit";

/// Step name: ask lenders for offers and wait for the selection.
pub const STEP_REQUEST_OFFERS: &str = "request_offers";

/// Step name: book the selected offer with the lender.
pub const STEP_ACCEPT_OFFER: &str = "accept_offer";

/// Step name: pay the seller.
pub const STEP_DISBURSE_FUNDS: &str = "disburse_funds";

/// Default time lenders have to answer.
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_secs(48 * 60 * 60);

/// Default exposure the in-memory credit bureau approves per invoice.
pub const DEFAULT_CREDIT_LIMIT_CENTS: i64 = 10_000_000;

/// The collaborators the workflow's steps call.
#[derive(Clone)]
pub struct FinancingServices {
    pub invoices: Arc<dyn InvoiceRegistry>,
    pub credit: Arc<dyn CreditBureau>,
    pub lenders: Arc<dyn LenderNetwork>,
    pub payments: Arc<dyn PaymentRail>,
}

/// In-memory collaborators, kept concrete so callers can inject faults and
/// inspect effects.
#[derive(Debug, Clone)]
pub struct InMemoryFinancingServices {
    pub activity: ActivityLog,
    pub invoices: InMemoryInvoiceRegistry,
    pub credit: InMemoryCreditBureau,
    pub lenders: InMemoryLenderNetwork,
    pub payments: InMemoryPaymentRail,
}

impl InMemoryFinancingServices {
    pub fn new(credit_limit_cents: i64) -> Self {
        let activity = ActivityLog::new();
        Self {
            invoices: InMemoryInvoiceRegistry::new(activity.clone()),
            credit: InMemoryCreditBureau::new(credit_limit_cents, activity.clone()),
            lenders: InMemoryLenderNetwork::new(activity.clone()),
            payments: InMemoryPaymentRail::new(activity.clone()),
            activity,
        }
    }

    pub fn services(&self) -> FinancingServices {
        FinancingServices {
            invoices: Arc::new(self.invoices.clone()),
            credit: Arc::new(self.credit.clone()),
            lenders: Arc::new(self.lenders.clone()),
            payments: Arc::new(self.payments.clone()),
        }
    }
}

/// Builds the invoice-financing definition over `services`.
pub fn definition(services: &FinancingServices, offer_timeout: Duration) -> WorkflowDefinition {
    WorkflowDefinition::new(DEFINITION_ID, DEFINITION_VERSION)
        .step(
            StepSpec::new(STEP_LOCK_INVOICE),
            LockInvoice(services.invoices.clone()),
        )
        .step(
            StepSpec::new(STEP_ASSESS_CREDIT),
            AssessCredit(services.credit.clone()),
        )
        .step(
            StepSpec::new(STEP_REQUEST_OFFERS).awaits_callback(offer_timeout),
            RequestOffers(services.lenders.clone()),
        )
        .step(
            StepSpec::new(STEP_ACCEPT_OFFER).requires_dedupe(),
            AcceptOffer(services.lenders.clone()),
        )
        .step(
            StepSpec::new(STEP_DISBURSE_FUNDS),
            DisburseFunds(services.payments.clone()),
        )
}

pub struct LockInvoice(pub Arc<dyn InvoiceRegistry>);

#[async_trait]
impl Step for LockInvoice {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let invoice_id = ctx.str_field("invoice_id")?;
        let lock_id = self.0.lock(invoice_id, &ctx.idempotency_key).await?;
        Ok(StepOutput::completed(fields! { "lock_id" => lock_id }))
    }

    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), StepError> {
        self.0.unlock(ctx.str_field("lock_id")?).await?;
        Ok(())
    }
}

pub struct AssessCredit(pub Arc<dyn CreditBureau>);

#[async_trait]
impl Step for AssessCredit {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let decision = self
            .0
            .assess(
                ctx.str_field("invoice_id")?,
                ctx.i64_field("amount_cents")?,
                &ctx.idempotency_key,
            )
            .await?;
        Ok(StepOutput::completed(fields! {
            "assessment_id" => decision.assessment_id,
            "credit_limit_cents" => decision.limit_cents,
        }))
    }

    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), StepError> {
        self.0.release(ctx.str_field("assessment_id")?).await?;
        Ok(())
    }
}

pub struct RequestOffers(pub Arc<dyn LenderNetwork>);

#[async_trait]
impl Step for RequestOffers {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let request = self
            .0
            .request_offers(
                ctx.str_field("invoice_id")?,
                ctx.i64_field("amount_cents")?,
                &ctx.idempotency_key,
            )
            .await?;
        Ok(StepOutput::parked(
            request.correlation_id,
            fields! { "offer_request_id" => request.request_id },
        ))
    }

    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), StepError> {
        self.0.withdraw(ctx.str_field("offer_request_id")?).await?;
        Ok(())
    }
}

pub struct AcceptOffer(pub Arc<dyn LenderNetwork>);

#[async_trait]
impl Step for AcceptOffer {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let acceptance = self.0.accept(ctx.str_field("offer_id")?).await?;
        Ok(StepOutput::completed(fields! {
            "acceptance_id" => acceptance.acceptance_id,
        }))
    }

    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), StepError> {
        self.0.release(ctx.str_field("acceptance_id")?).await?;
        Ok(())
    }
}

pub struct DisburseFunds(pub Arc<dyn PaymentRail>);

#[async_trait]
impl Step for DisburseFunds {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let disbursement = self
            .0
            .disburse(
                ctx.str_field("seller_account")?,
                ctx.i64_field("amount_cents")?,
                &ctx.idempotency_key,
            )
            .await?;
        Ok(StepOutput::completed(fields! {
            "disbursement_id" => disbursement.disbursement_id,
            "disbursed_cents" => disbursement.amount_cents,
        }))
    }

    async fn compensate(&self, ctx: &CompensationContext) -> Result<(), StepError> {
        self.0
            .reverse(ctx.str_field("disbursement_id")?, &ctx.idempotency_key)
            .await?;
        Ok(())
    }
}
