//! GPU base driver substrate
//!
//! The memory and synchronization layer underneath a GPU driver's API and job
//! construction code.
//!
//! # Components
//!
//! - **Bank allocator** ([`mem`]): GPU-addressable blocks carved from banks
//!   with distinct capability rights, with per-order free lists, split/merge
//!   and adaptive holdback of freed memory.
//! - **Heaps** ([`mem::Heap`]): growable allocations chained from fixed blocks.
//! - **Sync objects** ([`sync`]): reference-counted, chainable completion
//!   handles that free a job's memory once every job has finished.
//!
//! # Concurrency
//!
//! Every bank, the descriptor pool and every sync object has its own lock.
//! A bank lock may be held while taking the descriptor pool lock; completion
//! routines run with the sync object's lock released.

pub mod config;
pub mod mem;
pub mod sync;
pub mod telemetry;

use serde::Serialize;

pub use config::{EnvConfig, MemConfig};
pub use mem::{Heap, MemError, MemHandle, MemList, MemRights, MemorySystem};
pub use sync::{CleanupWorker, SyncError, SyncHandle, WaitHandle};

/// Opaque tag identifying the calling driver context.
///
/// Passed through allocation and sync entry points and handed to completion
/// callbacks; the allocator itself does not act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ContextTag(pub u64);

impl ContextTag {
    pub const NONE: Self = Self(0);
}
