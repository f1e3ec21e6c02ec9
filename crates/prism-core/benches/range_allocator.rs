use criterion::{black_box, criterion_group, criterion_main, Criterion};
use prism_core::descriptor_pool::{DescriptorPool, HostDescriptorStorage, RangeAllocator};

fn bench_range_allocator(c: &mut Criterion) {
    let mut group = c.benchmark_group("Descriptor Ranges");

    group.bench_function("Linear growth (10k single slots)", |b| {
        b.iter(|| {
            let mut allocator = RangeAllocator::new(None);
            for _ in 0..10_000 {
                black_box(allocator.allocate(1).unwrap());
            }
        });
    });

    group.bench_function("Best-fit reuse (mixed sizes)", |b| {
        let mut allocator = RangeAllocator::new(None);
        let ranges: Vec<_> = (0..1_000).map(|i| allocator.allocate(1 + i % 16).unwrap()).collect();
        for range in &ranges {
            allocator.release(range.offset, range.size);
        }
        b.iter(|| {
            let mut scratch = allocator.clone();
            for i in 0..1_000 {
                black_box(scratch.allocate(1 + (i * 7) % 16).unwrap());
            }
        });
    });

    group.bench_function("Pool allocate/drop churn", |b| {
        let pool = DescriptorPool::new(HostDescriptorStorage::<u64>::default(), None);
        b.iter(|| {
            let ranges: Vec<_> = (0..256).map(|i| pool.allocate(1 + i % 8).unwrap()).collect();
            black_box(ranges.len());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_range_allocator);
criterion_main!(benches);
