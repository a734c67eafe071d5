//! Saga workflow engine.
//!
//! Drives multi-step business processes to completion over an event-sourced
//! log: each instance is a [`WorkflowInstance`] aggregate whose every
//! transition is an appended [`WorkflowEvent`]. Steps may park on an external
//! callback, transient failures are retried under a stable idempotency key, and
//! a failed instance has its completed steps compensated in reverse order.
//!
//! The reference workflow is invoice financing:
//! 1. Lock the invoice
//! 2. Assess credit
//! 3. Request lender offers (parks until a lender answers or the wait times out)
//! 4. Accept the selected offer
//! 5. Disburse funds

pub mod aggregate;
pub mod compensation;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod financing;
pub mod ledger;
pub mod notify;
pub mod retry;
pub mod services;
pub mod state;
pub mod step;
pub mod sweeper;
pub mod wait;

pub use aggregate::{ParkedWait, RecordPhase, StepExecutionRecord, WorkflowInstance};
pub use compensation::CompensationCoordinator;
pub use definition::{DefinitionRegistry, StepSpec, WorkflowDefinition};
pub use engine::{EngineConfig, InstanceSummary, InstanceView, RecoveryReport, WorkflowEngine};
pub use error::SagaError;
pub use events::WorkflowEvent;
pub use executor::{StepExecutor, StepOutcome};
pub use ledger::{DedupeLedger, InMemoryDedupeLedger, PostgresDedupeLedger};
pub use notify::{BroadcastPublisher, NoopPublisher, Notification, NotificationPublisher, Topic};
pub use retry::RetryPolicy;
pub use state::{InstanceStatus, StepStatus};
pub use step::{
    CompensationContext, ContextMap, FailureKind, Idempotency, Step, StepContext, StepError,
    StepOutput,
};
pub use sweeper::TimeoutSweeper;
pub use wait::{InMemoryWaitRegistry, PostgresWaitRegistry, WaitRegistry, WaitToken};
