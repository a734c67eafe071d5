//! Integration tests: workflow engine → ProjectionProcessor → both views.

use std::sync::Arc;
use std::time::Duration;

use event_store::InMemoryEventStore;
use projections::{ActiveInstancesView, InterventionKind, OperatorQueueView, ProjectionProcessor};
use saga::financing::{self, InMemoryFinancingServices};
use saga::{
    DefinitionRegistry, EngineConfig, InMemoryDedupeLedger, InMemoryWaitRegistry, InstanceStatus,
    RetryPolicy, WorkflowEngine, fields,
};

struct Setup {
    engine: WorkflowEngine<InMemoryEventStore>,
    processor: ProjectionProcessor<InMemoryEventStore>,
    active: ActiveInstancesView,
    queue: OperatorQueueView,
    fakes: InMemoryFinancingServices,
}

fn setup() -> Setup {
    let store = InMemoryEventStore::new();
    let fakes = InMemoryFinancingServices::new(1_000_000);
    let mut registry = DefinitionRegistry::new();
    registry
        .register(financing::definition(&fakes.services(), Duration::from_secs(3600)))
        .unwrap();

    let engine = WorkflowEngine::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(InMemoryWaitRegistry::new()),
        Arc::new(InMemoryDedupeLedger::new()),
        EngineConfig {
            retry: RetryPolicy::immediate(3),
            compensation_retry: RetryPolicy::immediate(3),
            ..EngineConfig::default()
        },
    );

    let active = ActiveInstancesView::new();
    let queue = OperatorQueueView::new();
    let mut processor = ProjectionProcessor::new(store);
    processor.register(Box::new(active.clone()));
    processor.register(Box::new(queue.clone()));

    Setup {
        engine,
        processor,
        active,
        queue,
        fakes,
    }
}

fn application(invoice_id: &str) -> saga::ContextMap {
    fields! {
        "invoice_id" => invoice_id,
        "amount_cents" => 250_000,
        "seller_account" => "ACCT-42",
    }
}

#[tokio::test]
async fn test_parked_instance_is_active_until_completed() {
    let s = setup();

    let started = s
        .engine
        .start(financing::DEFINITION_ID, application("INV-1"))
        .await
        .unwrap();
    s.processor.run_catch_up().await.unwrap();

    let summary = s.active.get(started.instance_id).await.unwrap();
    assert_eq!(summary.status, InstanceStatus::AwaitingEvent);
    assert_eq!(summary.current_step_index, 2);
    let correlation_id = summary.awaiting.unwrap();

    s.engine
        .resume(&correlation_id, fields! { "offer_id" => "OFFER-1" })
        .await
        .unwrap();
    s.processor.run_catch_up().await.unwrap();

    assert!(s.active.get(started.instance_id).await.is_none());
    assert_eq!(s.active.count().await, 0);
    assert_eq!(s.queue.count().await, 0);
    let checkpoints = s.processor.checkpoints().await;
    assert_eq!(checkpoints[0].1, checkpoints[1].1);
}

#[tokio::test]
async fn test_compensation_failure_reaches_operator_queue() {
    let s = setup();
    s.fakes.lenders.lose_next_accept_responses(1);

    let started = s
        .engine
        .start(financing::DEFINITION_ID, application("INV-2"))
        .await
        .unwrap();
    let view = s.engine.get_instance(started.instance_id).await.unwrap();
    let correlation_id = view.awaiting.unwrap().correlation_id;
    s.engine
        .resume(&correlation_id, fields! { "offer_id" => "OFFER-2" })
        .await
        .unwrap();

    s.processor.run_catch_up().await.unwrap();

    assert!(s.active.all().await.is_empty());
    let entry = s.queue.get(started.instance_id).await.unwrap();
    assert_eq!(entry.definition_id, financing::DEFINITION_ID);
    assert_eq!(entry.failed_steps, vec![financing::STEP_ACCEPT_OFFER]);
    assert_eq!(entry.steps[0].kind, InterventionKind::Reconciliation);
}

#[tokio::test]
async fn test_clean_failure_leaves_queue_empty() {
    let s = setup();

    s.engine
        .start(
            financing::DEFINITION_ID,
            fields! {
                "invoice_id" => "INV-3",
                "amount_cents" => 5_000_000,
                "seller_account" => "ACCT-42",
            },
        )
        .await
        .unwrap();
    s.processor.run_catch_up().await.unwrap();

    assert!(s.active.all().await.is_empty());
    assert!(s.queue.entries().await.is_empty());
}

#[tokio::test]
async fn test_rebuild_matches_incremental_catch_up() {
    let s = setup();

    for n in 0..3 {
        s.engine
            .start(financing::DEFINITION_ID, application(&format!("INV-1{n}")))
            .await
            .unwrap();
        s.processor.run_catch_up().await.unwrap();
    }
    let incremental = s.active.all().await.len();

    s.processor.rebuild_all().await.unwrap();

    assert_eq!(incremental, 3);
    assert_eq!(s.active.all().await.len(), 3);
    assert_eq!(
        s.active.count_by_status().await[&InstanceStatus::AwaitingEvent],
        3
    );
}
