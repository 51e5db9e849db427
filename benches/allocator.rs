// Allocator Performance Benchmarks
// Tests the slab allocation fast path, the page pool reclaim cycle,
// and worker enqueue/drain throughput.
//
// The allocation benches fold two reclamation ticks into each
// iteration: without them garbage accumulates unboundedly and the pool
// hits its hard cap mid-run.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use mainspring::memory::page_pool::{PagePool, PagePoolConfig};
use mainspring::memory::slab::SlabAllocator;
use mainspring::worker::{InterruptMode, ThreadWorker, Worker};

fn bench_pool() -> PagePool {
    PagePool::with_config(PagePoolConfig {
        page_bytes: 4096,
        max_total_bytes: 64 << 20,
        auto_reclaim: false,
    })
}

fn bench_slab_allocate_release(c: &mut Criterion) {
    for size in [64usize, 1024] {
        let pool = bench_pool();
        let slab = SlabAllocator::new(&pool);

        c.bench_function(&format!("slab_allocate_release_reclaim_{size}"), |b| {
            b.iter(|| {
                let ptr = slab.allocate(black_box(size)).unwrap();
                unsafe { slab.deallocate(ptr) };
                pool.tick();
                pool.tick();
            })
        });
    }
}

fn bench_page_pool_cycle(c: &mut Criterion) {
    let pool = bench_pool();

    c.bench_function("page_pool_allocate_deallocate_reclaim", |b| {
        b.iter(|| {
            let page = pool.allocate().unwrap();
            unsafe { PagePool::deallocate(black_box(page)) };
            pool.tick();
            pool.tick();
        })
    });
}

fn bench_worker_enqueue_drain(c: &mut Criterion) {
    let worker = Worker::new("bench");

    c.bench_function("worker_enqueue_drain_100", |b| {
        b.iter(|| {
            for i in 0..100 {
                worker
                    .call(move || {
                        black_box(i);
                    })
                    .unwrap();
            }
            worker.process();
        })
    });
}

fn bench_thread_worker_roundtrip(c: &mut Criterion) {
    let tw = ThreadWorker::new("bench-thread", InterruptMode::Polling);
    tw.start(None, None, None);

    c.bench_function("thread_worker_call_roundtrip", |b| {
        b.iter(|| {
            let (send, recv) = std::sync::mpsc::channel();
            tw.call(move || send.send(()).unwrap()).unwrap();
            recv.recv().unwrap();
        })
    });

    tw.stop(true);
}

criterion_group!(
    benches,
    bench_slab_allocate_release,
    bench_page_pool_cycle,
    bench_worker_enqueue_drain,
    bench_thread_worker_roundtrip
);
criterion_main!(benches);
