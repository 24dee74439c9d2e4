//! Allocator throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use osomi_core::{BlockAllocator, VirtualBlockAllocator};

fn virtual_block(c: &mut Criterion) {
    c.bench_function("virtual_block_alloc_free_64", |b| {
        b.iter(|| {
            let mut va = VirtualBlockAllocator::new(64 << 20);
            let ranges: Vec<_> = (0..64u64)
                .map(|i| va.alloc(4096 + i * 256, 256).unwrap())
                .collect();
            for range in ranges.into_iter().rev() {
                va.free(range).unwrap();
            }
            black_box(va.largest_free_range())
        });
    });

    c.bench_function("virtual_block_fragmented_reuse", |b| {
        let mut va = VirtualBlockAllocator::new(16 << 20);
        let live: Vec<_> = (0..512).map(|_| va.alloc(8192, 256).unwrap()).collect();
        for range in live.iter().step_by(2) {
            va.free(*range).unwrap();
        }

        b.iter(|| {
            let range = va.alloc(4096, 256).unwrap();
            va.free(black_box(range)).unwrap();
        });
    });
}

fn block_allocator(c: &mut Criterion) {
    c.bench_function("block_allocator_churn", |b| {
        let mut pool = BlockAllocator::new(64 * 1024);
        b.iter(|| {
            let mut handles: Vec<_> = (0..256u64).map(|i| Some(pool.alloc(i))).collect();
            for handle in &mut handles {
                black_box(pool.dealloc(handle));
            }
        });
    });
}

criterion_group!(benches, virtual_block, block_allocator);
criterion_main!(benches);
