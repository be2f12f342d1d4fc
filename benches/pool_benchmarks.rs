//! Throughput and latency benchmarks for the scheduler and the cache's
//! discrete-scale quantization.
//!
//! Uses `criterion` with a shared `tokio::runtime::Runtime`, one
//! `bench_function` per hot path, and a parametrized `benchmark_group` for
//! batch sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pool_runtime::cache::calculate_discrete_scale;
use pool_runtime::task::{Priority, TaskOptions};
use pool_runtime::{RuntimeBuilder, RuntimeConfig};
use tokio::runtime::Runtime;

fn bench_submit_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = rt.block_on(async { RuntimeBuilder::new(RuntimeConfig::default()).build_pool().unwrap() });

    c.bench_function("submit_single_task", |b| {
        b.iter(|| {
            rt.block_on(async {
                let submission = pool
                    .submit("calc/add", "calc", serde_json::json!({}), Priority::Normal, TaskOptions::default())
                    .await
                    .unwrap();
                black_box(submission.wait().await.unwrap())
            })
        });
    });
}

fn bench_submit_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = rt.block_on(async { RuntimeBuilder::new(RuntimeConfig::default()).build_pool().unwrap() });

    let mut group = c.benchmark_group("submit_throughput");
    for batch_size in [1usize, 10, 50, 200].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let mut submissions = Vec::with_capacity(size);
                    for _ in 0..size {
                        submissions.push(
                            pool.submit("calc/add", "calc", serde_json::json!({}), Priority::Normal, TaskOptions::default())
                                .await
                                .unwrap(),
                        );
                    }
                    for submission in submissions {
                        black_box(submission.wait().await.unwrap());
                    }
                })
            });
        });
    }
    group.finish();
}

fn bench_discrete_scale_quantization(c: &mut Criterion) {
    let scales = vec![10, 25, 50, 75, 100, 150, 200];
    c.bench_function("calculate_discrete_scale", |b| {
        b.iter(|| black_box(calculate_discrete_scale(1920, 1080, Some(480), None, 2.0, black_box(&scales))));
    });
}

criterion_group!(benches, bench_submit_latency, bench_submit_throughput, bench_discrete_scale_quantization);
criterion_main!(benches);
