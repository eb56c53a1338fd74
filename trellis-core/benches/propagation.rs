//! Propagation benchmarks: how long a write takes to become a fresh read
//! through different graph shapes.

use std::sync::{Arc, Weak};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use trellis_core::reactive::{
    Change, CollectionObserver, CollectionSource, Derived, Input, InputList, MapCollection,
    Notification, Observer,
};

fn chain(input: &Input<u64>, len: usize) -> Derived<u64> {
    let mut tail = {
        let input = input.clone();
        Derived::new(move |cx| Ok(cx.get(&input)? + 1))
    };
    for _ in 1..len {
        let previous = tail.clone();
        tail = Derived::new(move |cx| Ok(cx.get(&previous)? + 1));
    }
    tail
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_set_then_read");
    for len in [1usize, 16, 128] {
        let input = Input::new(0u64);
        let tail = chain(&input, len);
        let mut next = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                next += 1;
                input.set(next);
                black_box(tail.get().unwrap())
            })
        });
    }
    group.finish();
}

/// One input feeding many nodes, of which only one is read.
fn bench_fanout_single_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_single_read");
    for width in [16usize, 256] {
        let input = Input::new(0u64);
        let nodes: Vec<_> = (0..width as u64)
            .map(|offset| {
                let input = input.clone();
                Derived::new(move |cx| Ok(cx.get(&input)? + offset))
            })
            .collect();
        for node in &nodes {
            node.get().unwrap();
        }

        let mut next = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                next += 1;
                input.set(next);
                black_box(nodes[0].get().unwrap())
            })
        });
    }
    group.finish();
}

/// Reading a clean node.
fn bench_clean_read(c: &mut Criterion) {
    let input = Input::new(1u64);
    let tail = chain(&input, 16);
    tail.get().unwrap();
    c.bench_function("clean_read", |b| b.iter(|| black_box(tail.get().unwrap())));
}

struct Sink;

impl Observer for Sink {
    fn notify(&self, _: Notification) {}
}

impl CollectionObserver<u64> for Sink {
    fn on_added(&self, _: Change, _: usize, _: &u64) {}
    fn on_removed(&self, _: Change, _: usize, _: &u64) {}
    fn on_replaced(&self, _: Change, _: usize, _: &u64, _: &u64) {}
}

/// A single replace on a large list, patched in place versus recomputed.
fn bench_map_replace(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_replace");
    let len = 10_000u64;

    let list = InputList::new((0..len).collect());
    let mapped = MapCollection::new(&list, |x: &u64| x * 2);
    let sink = Arc::new(Sink);
    let _subscription =
        mapped.add_collection_observer(Arc::downgrade(&sink) as Weak<dyn CollectionObserver<u64>>);
    mapped.items().unwrap();
    let mut next = len;
    group.bench_function("incremental", |b| {
        b.iter(|| {
            next += 1;
            list.replace(0, next).unwrap();
            black_box(mapped.items().unwrap().len())
        })
    });

    let list = InputList::new((0..len).collect());
    let mapped = MapCollection::new(&list, |x: &u64| x * 2);
    mapped.items().unwrap();
    let mut next = len;
    group.bench_function("recompute", |b| {
        b.iter(|| {
            next += 1;
            list.replace(0, next).unwrap();
            black_box(mapped.items().unwrap().len())
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_chain,
    bench_fanout_single_read,
    bench_clean_read,
    bench_map_replace
);
criterion_main!(benches);
