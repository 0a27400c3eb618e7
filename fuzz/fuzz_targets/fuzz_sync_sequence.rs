//! Fuzz target for sync object call sequences.
//!
//! Misordered calls must be rejected with an error, never panic, and a
//! started object must complete at most once.

#![no_main]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arbitrary::Arbitrary;
use gpu_base::sync::SyncHandle;
use gpu_base::ContextTag;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Register(u8),
    Release(u8),
    Flush(u8),
    Chain { parent: u8, child: u8 },
}

fuzz_target!(|ops: Vec<Op>| {
    let calls: Vec<Arc<AtomicUsize>> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let syncs: Vec<SyncHandle> = calls
        .iter()
        .map(|count| {
            let sync = SyncHandle::new_core(ContextTag::NONE);
            let count = count.clone();
            let _ = sync.set_callback(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
            sync
        })
        .collect();
    let pick = |i: u8| &syncs[usize::from(i) % syncs.len()];

    for op in ops.into_iter().take(512) {
        let _ = match op {
            Op::Register(i) => pick(i).register_reference(),
            Op::Release(i) => pick(i).release_reference(),
            Op::Flush(i) => pick(i).flush(),
            Op::Chain { parent, child } => SyncHandle::add_to_sync_handle(pick(parent), pick(child)),
        };
    }

    for (sync, count) in syncs.iter().zip(&calls) {
        let count = count.load(Ordering::SeqCst);
        assert!(count <= 1);
        assert_eq!(count == 1, sync.is_completed());
    }
});
