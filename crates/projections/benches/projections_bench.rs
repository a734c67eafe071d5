use common::{AggregateId, CorrelationId, IdempotencyKey};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{Aggregate, DomainEvent};
use event_store::{EventEnvelope, EventStore, ExpectedVersion, InMemoryEventStore, Version};
use projections::{
    ActiveInstancesView, InstanceEvent, OperatorQueueView, Projection, ProjectionProcessor,
};
use saga::events::StepParkedData;
use saga::{WorkflowEvent, WorkflowInstance, fields};

use std::sync::Arc;

fn make_envelope(instance_id: AggregateId, version: i64, event: &WorkflowEvent) -> EventEnvelope {
    EventEnvelope::builder()
        .aggregate_id(instance_id)
        .aggregate_type(WorkflowInstance::aggregate_type())
        .event_type(DomainEvent::event_type(event))
        .version(Version::new(version))
        .payload(event)
        .unwrap()
        .build()
        .unwrap()
}

/// Events of an instance that ran two steps and parked on the third.
fn parked_instance(instance_id: AggregateId) -> Vec<EventEnvelope> {
    let mut events = vec![WorkflowEvent::instance_started(
        instance_id,
        "invoice-financing",
        1,
        fields! { "invoice_id" => "INV-1", "amount_cents" => 250_000 },
    )];
    for (index, name) in ["lock_invoice", "assess_credit"].iter().enumerate() {
        events.push(WorkflowEvent::attempt_started(
            index,
            *name,
            1,
            IdempotencyKey::derive(instance_id, name, 1),
        ));
        events.push(WorkflowEvent::step_succeeded(index, *name, 1, fields! { "ok" => true }, false));
    }
    events.push(WorkflowEvent::attempt_started(
        2,
        "request_offers",
        1,
        IdempotencyKey::derive(instance_id, "request_offers", 1),
    ));
    events.push(WorkflowEvent::StepParked(StepParkedData {
        step_index: 2,
        step_name: "request_offers".to_string(),
        attempt: 1,
        correlation_id: CorrelationId::new(format!("offers:{instance_id}")),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(48),
        resume_schema_version: 1,
        fields: fields! { "offer_request_id" => "REQ-1" },
    }));

    events
        .iter()
        .enumerate()
        .map(|(i, e)| make_envelope(instance_id, i as i64 + 1, e))
        .collect()
}

/// Populate a store with N parked instances, 7 events each.
async fn populate_store(store: &InMemoryEventStore, n: usize) {
    for _ in 0..n {
        store
            .append(parked_instance(AggregateId::new()), ExpectedVersion::Any)
            .await
            .unwrap();
    }
}

fn bench_catch_up_100_instances(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();

    rt.block_on(populate_store(&store, 100));

    c.bench_function("projections/catch_up_700_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut processor = ProjectionProcessor::new(store.clone());
                processor.register(Box::new(ActiveInstancesView::new()) as Box<dyn Projection>);
                processor.register(Box::new(OperatorQueueView::new()) as Box<dyn Projection>);
                processor.run_catch_up().await.unwrap();
            });
        });
    });
}

fn bench_catch_up_1000_instances(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();

    rt.block_on(populate_store(&store, 1000));

    c.bench_function("projections/catch_up_7000_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut processor = ProjectionProcessor::new(store.clone());
                processor.register(Box::new(ActiveInstancesView::new()) as Box<dyn Projection>);
                processor.run_catch_up().await.unwrap();
            });
        });
    });
}

fn bench_decode_and_apply(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let view = Arc::new(ActiveInstancesView::new());

    c.bench_function("projections/decode_and_apply", |b| {
        b.iter(|| {
            rt.block_on(async {
                let instance_id = AggregateId::new();
                let event = WorkflowEvent::instance_started(instance_id, "invoice-financing", 1, fields! {});
                let envelope = make_envelope(instance_id, 1, &event);
                let decoded = InstanceEvent::decode(&envelope).unwrap().unwrap();
                view.apply(&decoded).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_catch_up_100_instances,
    bench_catch_up_1000_instances,
    bench_decode_and_apply
);
criterion_main!(benches);
