//! Work queue throughput benchmark.
//!
//! Measures add/get/done cycles, coalescing of duplicate adds and full
//! worker-pool dispatch using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kubehandler::{BoxError, EventType, ObjectKey, WorkItem, WorkQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn items(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::new("Pod", EventType::Add, ObjectKey::new("bench", format!("pod-{}", i))))
        .collect()
}

fn bench_add_get_done(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sizes: &[usize] = &[100, 1_000, 10_000];

    let mut group = c.benchmark_group("add_get_done");
    for &size in sizes {
        let batch = items(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| {
                rt.block_on(async {
                    let queue = WorkQueue::new("bench");
                    for item in batch {
                        queue.add(item.clone());
                    }
                    while !queue.is_empty() {
                        let item = queue.get().await.unwrap();
                        queue.done(black_box(&item));
                    }
                })
            });
        });
    }
    group.finish();
}

fn bench_coalesce(c: &mut Criterion) {
    let item = items(1).remove(0);

    c.bench_function("coalesce_1000_duplicates", |b| {
        b.iter(|| {
            let queue = WorkQueue::new("bench");
            for _ in 0..1_000 {
                queue.add(black_box(item.clone()));
            }
            assert_eq!(queue.len(), 1);
        });
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let workers: &[usize] = &[1, 4, 16];
    let batch = items(1_000);

    let mut group = c.benchmark_group("dispatch_1000");
    for &n in workers {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                rt.block_on(async {
                    let queue = WorkQueue::new("bench");
                    let processed = Arc::new(AtomicUsize::new(0));
                    let stop = CancellationToken::new();
                    {
                        let processed = processed.clone();
                        let stop = stop.clone();
                        let total = batch.len();
                        queue.register_add_handler("Pod", move |_namespace, _name| {
                            let processed = processed.clone();
                            let stop = stop.clone();
                            async move {
                                if processed.fetch_add(1, Ordering::SeqCst) + 1 == total {
                                    stop.cancel();
                                }
                                Ok::<_, BoxError>(())
                            }
                        });
                    }
                    for item in &batch {
                        queue.add(item.clone());
                    }
                    queue.run(n, stop).await;
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_add_get_done, bench_coalesce, bench_dispatch);
criterion_main!(benches);
