//! Benchmarks for ring construction and key lookup.

use catalogue_common::NodeAddr;
use catalogue_ring::{HashRing, DEFAULT_VIRTUAL_NODES};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn members(n: usize) -> Vec<NodeAddr> {
    (0..n)
        .map(|i| NodeAddr::new(format!("http://catalogue-{}:3030", i)))
        .collect()
}

fn bench_ring_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_build");
    for n_nodes in [3, 10, 50] {
        group.bench_with_input(BenchmarkId::from_parameter(n_nodes), &n_nodes, |b, &n| {
            let nodes = members(n);
            b.iter(|| black_box(HashRing::build(nodes.clone(), DEFAULT_VIRTUAL_NODES, 1)));
        });
    }
    group.finish();
}

fn bench_ring_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_lookup");
    for replicas in [1, 2, 3] {
        group.bench_with_input(
            BenchmarkId::from_parameter(replicas),
            &replicas,
            |b, &n| {
                let ring = HashRing::build(members(10), DEFAULT_VIRTUAL_NODES, 1);
                let mut i = 0u64;
                b.iter(|| {
                    let key = format!("offering-{}", i % 10_000);
                    i += 1;
                    black_box(ring.lookup(&key, n))
                });
            },
        );
    }
    group.finish();
}

fn bench_ring_remove_node(c: &mut Criterion) {
    let ring = HashRing::build(members(10), DEFAULT_VIRTUAL_NODES, 1);
    let victim = NodeAddr::new("http://catalogue-4:3030");
    c.bench_function("ring_remove_node_10", |b| {
        b.iter(|| black_box(ring.remove_node(&victim)));
    });
}

criterion_group!(
    benches,
    bench_ring_build,
    bench_ring_lookup,
    bench_ring_remove_node,
);
criterion_main!(benches);
