//! Effect runtime benchmarks using criterion.
//!
//! Benchmarks for the interpreter loop, fiber forking, queue and hub
//! throughput, and STM commits.
//!
//! Run with: cargo bench --bench effects_bench

use std::convert::Infallible;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skein_runtime::{Effect, Hub, Queue, Runtime, RuntimeConfig, Stm, TRef};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default())
}

/// Benchmark the synchronous run loop
fn bench_run_sync(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("run_sync");

    group.bench_function("succeed", |b| {
        let effect: Effect<u64> = Effect::succeed(1);
        b.iter(|| black_box(rt.run_sync(effect.clone()).unwrap()));
    });

    for depth in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(depth));
        group.bench_with_input(BenchmarkId::new("flat_map_chain", depth), &depth, |b, &depth| {
            let mut effect: Effect<u64> = Effect::succeed(0);
            for _ in 0..depth {
                effect = effect.flat_map(|n| Effect::succeed(n + 1));
            }
            b.iter(|| black_box(rt.run_sync(effect.clone()).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("while_loop", depth), &depth, |b, &depth| {
            let effect: Effect<u64> = Effect::while_loop(
                0u64,
                move |n| *n < depth,
                |n| Effect::succeed(*n),
                |n, _| n + 1,
            );
            b.iter(|| black_box(rt.run_sync(effect.clone()).unwrap()));
        });
    }

    group.bench_function("catch_all", |b| {
        let effect: Effect<u64, String> = Effect::<u64, String>::fail("boom".to_string())
            .catch_all(|_| Effect::<u64, String>::succeed(0));
        b.iter(|| black_box(rt.run_sync(effect.clone()).unwrap()));
    });

    group.finish();
}

/// Benchmark forking and joining fibers
fn bench_fork_join(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fork_join");

    group.bench_function("fork_join_one", |b| {
        let effect: Effect<u64> = Effect::<u64>::succeed(1)
            .fork()
            .flat_map(|fiber| fiber.join());
        b.iter(|| black_box(rt.run_blocking(effect.clone())));
    });

    for n in [10usize, 100] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("all_par", n), &n, |b, &n| {
            let effects: Vec<Effect<usize>> = (0..n).map(Effect::succeed).collect();
            let effect = Effect::all_par(effects);
            b.iter(|| black_box(rt.run_blocking(effect.clone())));
        });
    }

    group.finish();
}

/// Benchmark queue and hub throughput
fn bench_queue_hub(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_hub");
    let n = 1_000u64;
    group.throughput(Throughput::Elements(n));

    group.bench_function("queue_offer_take", |b| {
        let queue: Queue<u64> = Queue::back_pressure(64);
        let producer = {
            let queue = queue.clone();
            Effect::for_each((0..n).collect(), move |i| queue.offer(i))
        };
        let consumer = {
            let queue = queue.clone();
            Effect::for_each((0..n).collect(), move |_| queue.take())
        };
        let effect = producer
            .fork()
            .zip(&consumer.fork())
            .flat_map(|(p, c)| p.join().zip_right(&c.join()));
        b.iter(|| black_box(rt.run_blocking(effect.clone())));
    });

    group.bench_function("hub_publish_sliding", |b| {
        let hub: Hub<u64> = Hub::sliding(64);
        let subscription = rt.run_sync(hub.subscribe()).unwrap();
        let publish = Effect::for_each((0..n).collect(), move |i| hub.publish(i));
        b.iter(|| {
            black_box(rt.run_sync(publish.clone()).unwrap());
            black_box(rt.run_sync(subscription.take_all()).unwrap());
        });
    });

    group.finish();
}

/// Benchmark STM commits
fn bench_stm(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("stm");

    group.bench_function("commit_update", |b| {
        let counter = TRef::new(0u64);
        let tx = counter.update::<Infallible, _>(|n| n + 1);
        b.iter(|| black_box(rt.run_sync(tx.commit()).unwrap()));
    });

    for refs in [2usize, 16] {
        group.bench_with_input(BenchmarkId::new("commit_many_refs", refs), &refs, |b, &refs| {
            let cells: Vec<TRef<u64>> = (0..refs).map(|_| TRef::new(0)).collect();
            let tx = cells.iter().fold(Stm::<(), Infallible>::succeed(()), |acc, cell| {
                let cell = cell.clone();
                acc.flat_map(move |_| cell.update(|n| n + 1))
            });
            b.iter(|| black_box(rt.run_sync(tx.commit()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_run_sync,
    bench_fork_join,
    bench_queue_hub,
    bench_stm,
);
criterion_main!(benches);
