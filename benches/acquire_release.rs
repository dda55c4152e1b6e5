use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use prunepool::{BoundedPool, FnFactory, PoolConfiguration, PruneScheduler, PrunedPool};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn bounded_round_trip(c: &mut Criterion) {
    let pool = BoundedPool::new(
        PoolConfiguration::new().with_min_size(1).with_max_size(8),
        FnFactory::new(|| Ok(vec![0u8; 64])),
    )
    .unwrap();
    pool.open().unwrap();

    c.bench_function("bounded_acquire_release", |b| {
        b.iter(|| {
            let lease = pool.acquire_timeout(Duration::ZERO).unwrap();
            black_box(lease.len());
            pool.release(lease);
        })
    });
}

fn pruned_round_trip(c: &mut Criterion) {
    let config = PoolConfiguration::new()
        .with_min_size(1)
        .with_max_size(8)
        .with_prune_interval(Duration::from_millis(100));
    let pool = PrunedPool::with_scheduler(
        config,
        FnFactory::new(|| Ok(vec![0u8; 64])).with_validator(|v| !v.is_empty()),
        PruneScheduler::new("bench-pruner"),
    )
    .unwrap();
    pool.open().unwrap();

    c.bench_function("pruned_acquire_release", |b| {
        b.iter(|| {
            let lease = pool.acquire_timeout(Duration::ZERO).unwrap();
            black_box(lease.len());
            pool.release(lease);
        })
    });
    pool.close();
}

fn contended_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_acquire_release");
    for threads in [2usize, 4, 8] {
        let pool = Arc::new(
            BoundedPool::new(
                PoolConfiguration::new().with_max_size(4),
                FnFactory::new(|| Ok(0u64)),
            )
            .unwrap(),
        );
        pool.open().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                thread::scope(|s| {
                    for _ in 0..threads {
                        s.spawn(|| {
                            for _ in 0..100 {
                                let mut lease = pool.acquire_timeout(Duration::from_secs(1)).unwrap();
                                *lease += 1;
                                pool.release(lease);
                            }
                        });
                    }
                });
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bounded_round_trip, pruned_round_trip, contended_round_trip);
criterion_main!(benches);
