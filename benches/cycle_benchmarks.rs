//! Cycle orchestration benchmarks
//!
//! Measures whole cycles over small prepared heaps:
//! - concurrent global cycle with and without evacuation
//! - young cycle on a generational heap
//! - degenerated completion after a cancelled evacuation
//! - handshakes against polling mutators

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use regiongc::control::GcController;
use regiongc::handshake::HandshakeCoordinator;
use regiongc::phase::Phase;
use regiongc::test_utils::TestFixture;
use regiongc::thread::{MutatorThread, ThreadRegistry};
use regiongc::types::{Affiliation, GcCause, GenerationMode};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Heap with a rooted chain and a region worth of garbage next to it.
fn populated(fixture: TestFixture, affiliation: Affiliation, chain: usize) -> TestFixture {
    fixture.retire();
    let objects = fixture.alloc_chain(affiliation, chain).unwrap();
    fixture.root(objects[0]);
    fixture.garbage(affiliation, chain * 2).unwrap();
    fixture.retire();
    fixture
}

fn bench_global_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("global_cycle");
    group.measurement_time(Duration::from_secs(4));

    for chain in [8, 64] {
        group.bench_with_input(BenchmarkId::new("evacuating", chain), &chain, |b, &chain| {
            b.iter_batched(
                || populated(TestFixture::new().unwrap(), Affiliation::Young, chain),
                |fixture| {
                    let controller = GcController::new(fixture.heap().clone());
                    black_box(
                        controller
                            .run_cycle(GcCause::Explicit, GenerationMode::Global)
                            .unwrap(),
                    )
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.bench_function("abbreviated", |b| {
        b.iter_batched(
            || {
                let fixture = TestFixture::new().unwrap();
                let objects = fixture.alloc_chain(Affiliation::Young, 8).unwrap();
                fixture.root(objects[0]);
                fixture
            },
            |fixture| {
                let controller = GcController::new(fixture.heap().clone());
                black_box(
                    controller
                        .run_cycle(GcCause::Explicit, GenerationMode::Global)
                        .unwrap(),
                )
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_young_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("young_cycle");
    group.measurement_time(Duration::from_secs(4));

    group.bench_function("generational", |b| {
        b.iter_batched(
            || {
                let fixture = populated(TestFixture::generational().unwrap(), Affiliation::Young, 32);
                let old = fixture.alloc(Affiliation::Old, 1).unwrap();
                fixture.root(old);
                fixture
            },
            |fixture| {
                let controller = GcController::new(fixture.heap().clone());
                black_box(
                    controller
                        .run_cycle(GcCause::Heuristics, GenerationMode::Young)
                        .unwrap(),
                )
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_degenerated(c: &mut Criterion) {
    let mut group = c.benchmark_group("degenerated");
    group.measurement_time(Duration::from_secs(4));

    group.bench_function("from_evacuation", |b| {
        b.iter_batched(
            || {
                let fixture = populated(TestFixture::new().unwrap(), Affiliation::Young, 32);
                fixture.heap().fault_injector().arm(Phase::ConcEvac);
                fixture
            },
            |fixture| {
                let controller = GcController::new(fixture.heap().clone());
                black_box(
                    controller
                        .run_cycle(GcCause::Heuristics, GenerationMode::Global)
                        .unwrap(),
                )
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Benchmark handshakes against running mutators
fn bench_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");
    group.measurement_time(Duration::from_secs(3));

    for thread_count in [1, 4] {
        let registry = ThreadRegistry::new();
        let running = Arc::new(AtomicBool::new(true));
        let handles: Vec<_> = (0..thread_count)
            .map(|id| {
                let mutator = MutatorThread::new(id);
                registry.register(mutator.clone());
                let running = Arc::clone(&running);
                thread::spawn(move || {
                    mutator.unblock();
                    while running.load(Ordering::Relaxed) {
                        mutator.poll_safepoint();
                        thread::yield_now();
                    }
                    mutator.block();
                })
            })
            .collect();

        group.bench_with_input(
            BenchmarkId::new("rendezvous", format!("{thread_count}threads")),
            &thread_count,
            |b, _| {
                let coordinator = HandshakeCoordinator::new(&registry, Duration::from_secs(5));
                b.iter(|| black_box(coordinator.rendezvous().unwrap()))
            },
        );

        running.store(false, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_global_cycle,
    bench_young_cycle,
    bench_degenerated,
    bench_handshake
);
criterion_main!(benches);
