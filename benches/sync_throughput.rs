//! Sync object completion benchmarks.

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use gpu_base::mem::{MemRights, MemorySystem, MockBackend};
use gpu_base::sync::SyncHandle;
use gpu_base::{ContextTag, MemConfig};

fn bench_flush_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_complete");
    group.throughput(Throughput::Elements(1));

    group.bench_function("core_flush", |b| {
        b.iter(|| {
            let sync = SyncHandle::new_core(ContextTag::NONE);
            sync.register_reference().unwrap();
            sync.flush().unwrap();
            sync.release_reference().unwrap();
            black_box(sync.is_completed())
        })
    });

    let backend = Arc::new(MockBackend::single_bank(1 << 26, 20));
    let memory = Arc::new(MemorySystem::open(backend, MemConfig::default()).unwrap());
    group.bench_function("cleanup_list_4", |b| {
        b.iter(|| {
            let sync = SyncHandle::new(ContextTag::NONE, memory.clone());
            for _ in 0..4 {
                let mem = memory.alloc(ContextTag::NONE, 1024, 1, MemRights::GP_WRITE).unwrap();
                sync.add_mem_to_free_list(mem).unwrap();
            }
            sync.flush().unwrap();
        })
    });

    group.finish();
}

fn bench_contended_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_contended");
    let threads = 4;
    let per_thread = 1000;
    group.throughput(Throughput::Elements((threads * per_thread) as u64));

    group.bench_function("register_release", |b| {
        b.iter(|| {
            let sync = SyncHandle::new_core(ContextTag::NONE);
            sync.register_reference().unwrap();
            sync.flush().unwrap();
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let sync = sync.clone();
                    thread::spawn(move || {
                        for _ in 0..per_thread {
                            let guard = sync.reference().unwrap();
                            drop(guard);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            sync.release_reference().unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_flush_complete, bench_contended_release);
criterion_main!(benches);
