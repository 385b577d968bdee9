//! Performance benchmarks for the broker.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use switchboard::{handler, Broker, BrokerConfig, DeliveryKind, DispatchKind, Topic};

fn create_broker(dispatch: DispatchKind, subscribers: usize) -> Broker {
    let broker = Broker::new("bench", BrokerConfig::with_dispatch(dispatch)).unwrap();
    for i in 0..subscribers {
        let id = format!("s{}", i);
        broker
            .register_subscriber(&id, handler(|p| {
                black_box(p.payload.len());
                Ok(())
            }), DeliveryKind::Inline)
            .unwrap();
        let pattern = format!("metrics/host-{}/*", i % 16);
        broker.subscribe(&id, (i % 5) as i32, &[pattern.as_str(), "metrics/?/cpu"]).unwrap();
    }
    broker
}

/// Benchmark the matching walk for patterns of growing depth
fn bench_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matching");

    for depth in [2, 8, 32] {
        let levels: Vec<String> = (0..depth).map(|i| format!("l{}", i)).collect();
        let topic = Topic::parse(levels.join("/"));
        let mut one = levels.clone();
        one[depth - 1] = "?".to_string();
        let pattern = Topic::parse(one.join("/"));

        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, _| {
            b.iter(|| black_box(pattern.matches(black_box(&topic))));
        });
    }

    group.finish();
}

/// Benchmark publish with a warm match cache for varying subscriber counts
fn bench_publish_warm_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_warm_cache");

    for subscribers in [1, 64, 512] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                let broker = create_broker(DispatchKind::Inline, n);
                b.iter(|| {
                    broker
                        .publish("metrics/host-3/cpu", vec![json!(0.42)])
                        .unwrap();
                });
            },
        );
    }

    group.finish();
}

/// Benchmark publish when every call misses the cache
fn bench_publish_cold_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_cold_cache");

    for subscribers in [64, 512] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                let broker = create_broker(DispatchKind::Inline, n);
                let mut i = 0u64;
                b.iter(|| {
                    i += 1;
                    // Re-subscribing invalidates the cache.
                    broker.subscribe("s0", 0, &["bench/*"]).unwrap();
                    broker
                        .publish(&format!("metrics/host-{}/cpu", i % 16), vec![json!(i)])
                        .unwrap();
                });
            },
        );
    }

    group.finish();
}

/// Benchmark publish through the background dispatch kinds
fn bench_publish_dispatch_kinds(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_dispatch");

    for dispatch in [
        DispatchKind::Inline,
        DispatchKind::Detached,
        DispatchKind::QueuedEphemeral,
        DispatchKind::QueuedPersistent,
    ] {
        group.bench_function(dispatch.to_string(), |b| {
            let broker = create_broker(dispatch, 32);
            b.iter(|| {
                broker
                    .publish("metrics/host-1/cpu", vec![json!(1)])
                    .unwrap();
            });
            broker.close();
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_topic_matching,
    bench_publish_warm_cache,
    bench_publish_cold_cache,
    bench_publish_dispatch_kinds,
);
criterion_main!(benches);
