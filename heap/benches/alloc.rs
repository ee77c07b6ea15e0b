use criterion::{criterion_group, criterion_main, Criterion};

fn alloc_free_small(c: &mut Criterion) {
    heap::minit(65536, 262144);
    c.bench_function("alloc_free_small", |b| {
        b.iter(|| {
            let p = heap::alloc(std::hint::black_box(32));
            unsafe { heap::free(p) };
        })
    });
}

fn alloc_free_large(c: &mut Criterion) {
    c.bench_function("alloc_free_large", |b| {
        b.iter(|| {
            let p = heap::alloc(std::hint::black_box(2048));
            unsafe { heap::free(p) };
        })
    });
}

fn purge_epoch(c: &mut Criterion) {
    c.bench_function("purge_epoch", |b| {
        b.iter(|| {
            let mut held = Vec::with_capacity(64);
            for i in 0..64usize {
                held.push(heap::alloc(16 + i * 8));
            }
            for p in held {
                unsafe { heap::free(p) };
            }
            heap::purge();
        })
    });
}

criterion_group!(benches, alloc_free_small, alloc_free_large, purge_epoch);
criterion_main!(benches);
