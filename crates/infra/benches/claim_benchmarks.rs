use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use workforge_core::{decide, ExecutionResult, TaskType, TransitionPolicy, WorkItem, WorkerId};
use workforge_infra::queue::{
    ClaimResult, Dispatcher, DispatcherConfig, HandlerRegistry, InMemoryWorkItemStore,
    LeaseManager, WorkItemStore,
};

const LEASE: Duration = Duration::from_secs(300);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn seeded_store(rt: &tokio::runtime::Runtime, count: usize) -> Arc<InMemoryWorkItemStore> {
    let store = InMemoryWorkItemStore::arc();
    let task_type = TaskType::new("bench.noop");
    let due = Utc::now() - chrono::Duration::seconds(1);
    rt.block_on(async {
        for n in 0..count {
            let item = WorkItem::new(&task_type, serde_json::json!({ "n": n })).scheduled_at(due);
            store.insert(item).await.unwrap();
        }
    });
    store
}

fn bench_claim_and_release(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_and_release");
    group.throughput(Throughput::Elements(1));

    let store = seeded_store(&rt, 1);
    let id = rt.block_on(async { store.list_due(Utc::now(), 1).await.unwrap()[0].id });
    let leases = LeaseManager::new(store.clone(), WorkerId::new("bench").unwrap(), LEASE);
    let policy = TransitionPolicy::for_type(&TaskType::new("bench.noop").with_step_poll_interval(Duration::ZERO));

    // A "not ready yet" release leaves the item due, so every iteration can claim it again.
    group.bench_function("single_item", |b| {
        b.iter(|| rt.block_on(async {
            let claim = match leases.try_claim(id, Utc::now()).await.unwrap() {
                ClaimResult::Claimed(claim) => claim,
                ClaimResult::NotAvailable => panic!("item should be claimable"),
            };
            let transition = decide(
                &claim.item,
                &policy,
                ExecutionResult::StepPending,
                claim.item.payload.clone(),
                Utc::now(),
            );
            black_box(leases.release(claim, &transition).await.unwrap());
        }));
    });

    group.finish();
}

fn bench_candidate_scan(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("candidate_scan");

    for backlog in [100usize, 1_000, 10_000].iter() {
        let store = seeded_store(&rt, *backlog);
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(store.find_candidates(Utc::now(), LEASE, 16).await.unwrap());
                })
            });
        });
    }

    group.finish();
}

fn bench_drain_backlog(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("drain_backlog");
    group.sample_size(10);

    for backlog in [100usize, 1_000].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &backlog| {
            b.iter_batched(
                || {
                    let store = seeded_store(&rt, backlog);
                    let mut registry = HandlerRegistry::new();
                    registry
                        .register_fn(TaskType::new("bench.*"), |_item| async { Ok(()) })
                        .unwrap();
                    let config = DispatcherConfig::default()
                        .with_name("bench")
                        .with_batch_size(64)
                        .with_lease_duration(LEASE);
                    Dispatcher::new(store, Arc::new(registry), config)
                },
                |dispatcher| {
                    rt.block_on(async {
                        while dispatcher.poll_once(Utc::now()).await.unwrap() > 0 {}
                    });
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_and_release,
    bench_candidate_scan,
    bench_drain_backlog
);
criterion_main!(benches);
