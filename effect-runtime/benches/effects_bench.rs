//! Effect runtime benchmarks using criterion.
//!
//! Covers the interpreter's bind loop, fiber fork/join, the parallel
//! combinators, stream folding and schedule stepping.
//!
//! Run with: cargo bench --bench effects_bench

use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use effect_runtime::{make_commutative, Decision, Runtime, RuntimeConfig, Schedule, Stream, IO, UIO};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(4).build().unwrap()).unwrap()
}

fn chain_of(depth: u64) -> UIO<u64> {
    (0..depth).fold(UIO::succeed(0u64), |acc, _| acc.chain(|n| UIO::succeed(n + 1)))
}

/// Benchmark the sequential bind loop
fn bench_chain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("chain");

    for depth in [10u64, 1_000, 10_000] {
        let program = chain_of(depth);
        group.throughput(Throughput::Elements(depth));
        group.bench_with_input(BenchmarkId::new("flat_map", depth), &program, |b, program| {
            b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
        });
    }

    group.bench_function("map_1000", |b| {
        let program = (0..1_000).fold(UIO::succeed(0u64), |acc, _| acc.map(|n| n + 1));
        b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
    });

    group.bench_function("catch_all", |b| {
        let program = IO::<String, u64>::fail("boom".to_string()).catch_all(|_| IO::<String, u64>::succeed(1));
        b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
    });

    group.finish();
}

/// Benchmark fork and join
fn bench_fibers(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fibers");

    group.bench_function("fork_join", |b| {
        let program = UIO::succeed(1u64).fork().chain(|fiber| fiber.join());
        b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
    });

    group.bench_function("yield_100", |b| {
        let program = UIO::<()>::foreach_(0..100, |_| UIO::<()>::yield_now());
        b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
    });

    group.finish();
}

/// Benchmark the parallel combinators
fn bench_parallel(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("parallel");

    for count in [10u64, 100, 1_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("foreach_par", count), &count, |b, &count| {
            let program = UIO::<()>::foreach_par(0..count, |n| UIO::succeed(n * 2));
            b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
        });
        group.bench_with_input(BenchmarkId::new("foreach_par_n_4", count), &count, |b, &count| {
            let program = UIO::<()>::foreach_par_n(4, 0..count, |n| UIO::succeed(n * 2));
            b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
        });
    }

    group.bench_function("reduce_all_par_100", |b| {
        let sum = make_commutative(|a: u64, b: u64| a + b);
        let program = UIO::<()>::reduce_all_par(UIO::succeed(0), (1..100u64).map(UIO::succeed), sum);
        b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
    });

    group.bench_function("race", |b| {
        let program = UIO::succeed(1u64).race(UIO::never());
        b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
    });

    group.finish();
}

/// Benchmark pull-based stream folding
fn bench_stream(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("stream");

    for count in [64i64, 4_096, 65_536] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("range_fold", count), &count, |b, &count| {
            let program = Stream::<(), (), i64>::range(0, count).fold(0i64, |acc, n| acc + n);
            b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
        });
        group.bench_with_input(BenchmarkId::new("map_filter_collect", count), &count, |b, &count| {
            let program = Stream::<(), (), i64>::range(0, count)
                .map(|n| n * 3)
                .filter(|n| n % 2 == 0)
                .run_collect();
            b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
        });
    }

    group.bench_function("flat_map_100x10", |b| {
        let program = Stream::<(), (), i64>::range(0, 100)
            .flat_map(|n| Stream::range(n, n + 10))
            .fold(0i64, |acc, n| acc + n);
        b.iter(|| black_box(rt.unsafe_run_sync(program.clone())));
    });

    group.finish();
}

/// Benchmark schedule stepping outside the runtime
fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");

    group.bench_function("exponential_step", |b| {
        let schedule = Schedule::<(), Duration>::exponential(Duration::from_millis(1), 2.0)
            .both(Schedule::recurs(16));
        let mut driver = schedule.driver();
        let now = Instant::now();
        b.iter(|| {
            if let Decision::Done(_) = driver.next(now, &()) {
                driver.reset();
            }
        });
    });

    group.bench_function("jittered_spaced_step", |b| {
        let schedule = Schedule::<(), u64>::spaced(Duration::from_millis(10)).jittered(0.5, 1.5);
        let mut driver = schedule.driver();
        let now = Instant::now();
        b.iter(|| black_box(driver.next(now, &()).delay()));
    });

    group.finish();
}

criterion_group!(benches, bench_chain, bench_fibers, bench_parallel, bench_stream, bench_schedule);
criterion_main!(benches);

