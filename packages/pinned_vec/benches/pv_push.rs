//! Basic benchmarks for the `pinned_vec` crate: appending against `Vec`.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use pinned_vec::PinnedVec;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

// Vec gets the same page-aligned starting capacity that PinnedVec's first
// granule provides, so the comparison measures growth strategy, not start
// size.
fn first_granule_capacity() -> usize {
    let mut probe = PinnedVec::<u32>::new();
    probe.reserve(512);
    probe.capacity()
}

fn entrypoint(c: &mut Criterion) {
    let initial_capacity = first_granule_capacity();

    for kilobytes in [16_usize, 512, 2048] {
        let items = (kilobytes * 1024) / size_of::<u32>();

        let mut group = c.benchmark_group(format!("push_{kilobytes}kib"));

        group.bench_function("pinned_vec", |b| {
            b.iter(|| {
                let mut vec = PinnedVec::<u32>::new();
                vec.reserve(initial_capacity);

                for i in 0..items {
                    vec.push(i as u32);

                    if vec.len() == vec.capacity() {
                        vec.reserve(vec.capacity() * 2);
                    }
                }

                black_box(vec.len())
            });
        });

        group.bench_function("std_vec", |b| {
            b.iter(|| {
                let mut vec = Vec::<u32>::with_capacity(initial_capacity);

                for i in 0..items {
                    vec.push(i as u32);

                    if vec.len() == vec.capacity() {
                        vec.reserve(vec.capacity());
                    }
                }

                black_box(vec.len())
            });
        });

        group.finish();
    }
}
