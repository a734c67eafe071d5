use common::AggregateId;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use event_store::{EventEnvelope, EventStore, ExpectedVersion, InMemoryEventStore, Version};
use futures_util::StreamExt;

const LIFECYCLE: [&str; 6] = [
    "InstanceStarted",
    "StepAttemptStarted",
    "StepSucceeded",
    "StepWaiting",
    "StepResumed",
    "InstanceCompleted",
];

fn entry(instance_id: AggregateId, version: i64) -> EventEnvelope {
    let event_type = LIFECYCLE[(version as usize - 1) % LIFECYCLE.len()];
    EventEnvelope::builder()
        .aggregate_id(instance_id)
        .aggregate_type("WorkflowInstance")
        .event_type(event_type)
        .version(Version::new(version))
        .payload_raw(serde_json::json!({
            "type": event_type,
            "data": { "step_index": version, "fields": { "credit_score": 720 } }
        }))
        .metadata(event_store::TRIGGER_KEY, serde_json::json!("engine"))
        .build()
        .unwrap()
}

async fn seeded(instances: usize, per_instance: i64) -> (InMemoryEventStore, Vec<AggregateId>) {
    let store = InMemoryEventStore::new();
    let mut ids = Vec::with_capacity(instances);
    for _ in 0..instances {
        let id = AggregateId::new();
        let batch = (1..=per_instance).map(|v| entry(id, v)).collect();
        store.append(batch, ExpectedVersion::NoStream).await.unwrap();
        ids.push(id);
    }
    (store, ids)
}

/// One append per transition, each checked against the previous head.
fn bench_checked_lifecycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/checked_lifecycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let id = AggregateId::new();
                let mut head = Version::initial();
                for v in 1..=LIFECYCLE.len() as i64 {
                    head = store.append(vec![entry(id, v)], head.into()).await.unwrap();
                }
            });
        });
    });
}

fn bench_replay(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, ids) = rt.block_on(seeded(1, 100));
    let id = ids[0];

    let mut group = c.benchmark_group("event_store/replay");
    for until in [None, Some(50), Some(10)] {
        let label = until.map_or("full".to_string(), |v| format!("until_{v}"));
        group.bench_with_input(BenchmarkId::from_parameter(label), &until, |b, until| {
            b.iter(|| {
                rt.block_on(async {
                    store.read_stream(id, until.map(Version::new)).await.unwrap();
                });
            });
        });
    }
    group.finish();
}

fn bench_recovery_scan(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, _) = rt.block_on(seeded(500, 6));

    c.bench_function("event_store/stream_ids_500", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ids = store.stream_ids("WorkflowInstance").await.unwrap();
                assert_eq!(ids.len(), 500);
            });
        });
    });
}

fn bench_read_all(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, _) = rt.block_on(seeded(10, 100));

    c.bench_function("event_store/read_all_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let count = store.read_all().await.unwrap().count().await;
                assert_eq!(count, 1000);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_checked_lifecycle,
    bench_replay,
    bench_recovery_scan,
    bench_read_all,
);
criterion_main!(benches);
