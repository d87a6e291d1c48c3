//! Micro-benchmarks for pull evaluation.
//!
//! Measures the two paths that dominate real workloads: re-reading a clean
//! graph (memoized, no rule runs) and propagating an external write down a
//! dependency chain.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use weft_core::{Attribute, Graph, Subgraph};

fn build_chain(graph: &Graph, subgraph: &Subgraph, depth: usize) -> (Attribute<i64>, Attribute<i64>) {
    subgraph
        .scope(|| {
            let source = graph.external(0i64);
            let mut tail = source.clone();
            for _ in 0..depth {
                let input = tail.clone();
                tail = graph.computed(move |cx| cx.get(&input) + 1);
            }
            (source, tail)
        })
        .expect("live subgraph")
}

fn bench_clean_read(c: &mut Criterion) {
    let graph = Graph::new();
    let subgraph = graph.create_subgraph();
    let (_, tail) = build_chain(&graph, &subgraph, 64);
    tail.value();

    c.bench_function("clean_read_depth_64", |b| {
        b.iter(|| black_box(tail.value()))
    });
}

fn bench_write_then_read(c: &mut Criterion) {
    let graph = Graph::new();
    let subgraph = graph.create_subgraph();
    let (source, tail) = build_chain(&graph, &subgraph, 64);
    tail.value();

    let mut next = 1i64;
    c.bench_function("write_and_reread_depth_64", |b| {
        b.iter(|| {
            source.set(next);
            next += 1;
            black_box(tail.value())
        })
    });
}

fn bench_unchanged_write(c: &mut Criterion) {
    let graph = Graph::new();
    let subgraph = graph.create_subgraph();
    let (source, tail) = build_chain(&graph, &subgraph, 64);
    source.set(5);
    tail.value();

    c.bench_function("unchanged_write_depth_64", |b| {
        b.iter(|| {
            source.set(5);
            black_box(tail.value())
        })
    });
}

criterion_group!(
    benches,
    bench_clean_read,
    bench_write_then_read,
    bench_unchanged_write
);
criterion_main!(benches);
