use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use farmalloc::{CollectiveAllocator, SuballocatorKind};

const ARENA_SIZE: usize = 4096 * 255;

fn bench_small_alloc_dealloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("Small Allocation (64 bytes)");

    for kind in [SuballocatorKind::PurelyLocal, SuballocatorKind::SwappablePlain, SuballocatorKind::NewPerPage] {
        let engine = CollectiveAllocator::<4096>::new(64 * ARENA_SIZE);
        let suballoc = engine.get_suballocator(kind);
        group.bench_function(format!("{kind:?}"), |b| {
            b.iter_batched(
                || (),
                |()| {
                    let ptr = suballoc.allocate(64).unwrap();
                    black_box(ptr);
                    suballoc.deallocate(ptr, 64);
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_batch_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("Batch Allocation 1000");
    const BATCH_SIZE: usize = 1000;

    group.bench_function("PurelyLocal", |b| {
        b.iter_batched(
            || CollectiveAllocator::<4096>::new(64 * ARENA_SIZE),
            |engine| {
                let suballoc = engine.get_suballocator(SuballocatorKind::PurelyLocal);
                let mut ptrs = Vec::with_capacity(BATCH_SIZE);
                for _ in 0..BATCH_SIZE {
                    ptrs.push(black_box(suballoc.allocate(32).unwrap()));
                }
                for ptr in ptrs {
                    suballoc.deallocate(ptr, 32);
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_small_alloc_dealloc, bench_batch_allocate);
criterion_main!(benches);
