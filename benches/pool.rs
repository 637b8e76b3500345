//! Allocation throughput of both pools, against the global allocator.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;

use blockpool::{fixed_arena_size, ArenaBuf, FixedBlockPool, NoFallback, PoolAllocator, VariableBlockPool};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_fixed(c: &mut Criterion) {
    let mut buf = ArenaBuf::<{ fixed_arena_size(64, 128) }>::new();
    let mut pool = FixedBlockPool::<64, 128>::new(buf.arena()).unwrap();

    c.bench_function("fixed_alloc_free", |b| {
        b.iter(|| {
            let ptr = pool.allocate().unwrap();
            unsafe { pool.deallocate(black_box(ptr)) };
        })
    });

    c.bench_function("fixed_fill_drain", |b| {
        let mut ptrs = Vec::with_capacity(128);
        b.iter(|| {
            while let Ok(ptr) = pool.allocate() {
                ptrs.push(ptr);
            }
            for ptr in ptrs.drain(..) {
                unsafe { pool.deallocate(ptr) };
            }
        })
    });
}

fn bench_variable(c: &mut Criterion) {
    let mut group = c.benchmark_group("variable_alloc_free");
    for size in [8usize, 64, 512] {
        let mut buf = ArenaBuf::<{ 64 * 1024 }>::new();
        let mut pool = VariableBlockPool::from_arena(buf.arena()).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let ptr = pool.allocate(black_box(size)).unwrap();
                unsafe { pool.deallocate(ptr).unwrap() };
            })
        });
    }
    group.finish();

    // interleaved sizes keep the free list several blocks long
    c.bench_function("variable_fragmented", |b| {
        let mut buf = ArenaBuf::<{ 64 * 1024 }>::new();
        let mut pool = VariableBlockPool::from_arena(buf.arena()).unwrap();
        let mut ptrs = Vec::with_capacity(64);
        b.iter(|| {
            for i in 0..64 {
                ptrs.push(pool.allocate(16 + (i % 7) * 24).unwrap());
            }
            for ptr in ptrs.drain(..).step_by(2) {
                unsafe { pool.deallocate(ptr).unwrap() };
            }
            pool.reset();
        })
    });
}

fn bench_adapter(c: &mut Criterion) {
    let mut buf = ArenaBuf::<{ 16 * 1024 }>::new();
    let pool = RefCell::new(VariableBlockPool::from_arena(buf.arena()).unwrap());
    let adapter: PoolAllocator<'_, u64, _, NoFallback> = PoolAllocator::new(&pool);

    c.bench_function("adapter_u64x16", |b| {
        b.iter(|| {
            let ptr = adapter.allocate(16).unwrap();
            unsafe { adapter.deallocate(ptr, 16).unwrap() };
        })
    });

    let layout = Layout::array::<u64>(16).unwrap();
    c.bench_function("global_u64x16", |b| {
        b.iter(|| unsafe {
            let ptr = alloc(layout);
            dealloc(black_box(ptr), layout);
        })
    });
}

criterion_group!(benches, bench_fixed, bench_variable, bench_adapter);
criterion_main!(benches);
