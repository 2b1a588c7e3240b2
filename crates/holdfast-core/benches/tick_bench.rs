//! Criterion benchmarks for the Holdfast simulation engine.
//!
//! Two benchmark groups:
//! - `tick`: star networks around bases with relays and consumers
//! - `snapshot`: world snapshot encode and restore

use criterion::{Criterion, criterion_group, criterion_main};
use holdfast_core::engine::{DeployRequest, Engine};
use holdfast_core::id::*;
use holdfast_core::test_utils::*;

// ===========================================================================
// World builders
// ===========================================================================

/// `bases` networks, each a base feeding `fan_out` relays that each feed
/// one factory. Every base starts with a full core.
fn build_world(bases: usize, fan_out: usize) -> TestWorld {
    let mut w = TestWorld::new();
    for _ in 0..bases {
        let base = w.deploy_built(w.types.base, RED);
        w.set_core(base, 1000.0);
        for i in 0..fan_out {
            let relay = w
                .engine
                .deploy(DeployRequest::new(w.types.relay, RED).built());
            let factory = w
                .engine
                .deploy(DeployRequest::new(w.types.factory, RED).built());
            w.engine.connect(base, relay, (i % 4 + 1) as f64).unwrap();
            w.engine.connect(relay, factory, 1.0).unwrap();
        }
    }
    // settle orphan detection and initial saves
    w.engine.update(TICK);
    w
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");
    group.sample_size(30);

    let mut small = build_world(20, 10);
    group.bench_function("tick_420_nodes", |b| {
        b.iter(|| {
            small.engine.update(TICK);
        });
    });

    let mut large = build_world(100, 25);
    group.bench_function("tick_5100_nodes", |b| {
        b.iter(|| {
            large.engine.update(TICK);
        });
    });

    group.bench_function("rewire_and_tick", |b| {
        b.iter_batched(
            || build_world(20, 10),
            |mut w| {
                let connections: Vec<ConnectionId> =
                    w.engine.graph().connections().map(|(c, _)| c).step_by(7).collect();
                for c in connections {
                    w.engine.disconnect(c).unwrap();
                }
                w.engine.update(TICK);
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    group.sample_size(20);

    let mut w = build_world(100, 25);
    w.engine.flush();
    let bytes = w.engine.save_snapshot().unwrap();

    group.bench_function("save_5100_nodes", |b| {
        b.iter(|| {
            w.engine.save_snapshot().unwrap();
        });
    });

    group.bench_function("restore_5100_nodes", |b| {
        b.iter(|| {
            let restored: Engine = w.restart_from(&bytes).engine;
            restored.node_count()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_tick, bench_snapshot);
criterion_main!(benches);
