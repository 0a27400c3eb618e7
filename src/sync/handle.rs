//! Reference-counted completion objects.
//!
//! A sync object completes once it has been flushed and its reference count
//! has dropped to zero, whichever happens last. Completion runs exactly once
//! and with the object's lock released: the wait handle is triggered, the
//! callback runs, the parent (if any) loses one reference and finally the
//! cleanup list is freed.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use super::error::{violation, SyncError};
use super::wait::WaitHandle;
use super::worker::CleanupWorker;
use crate::mem::{MemHandle, MemList, MemorySystem};
use crate::telemetry;
use crate::ContextTag;

/// Serializes attaches so two crosswise attaches cannot both pass the cycle
/// check. Taken before any sync object lock.
static ATTACH: Mutex<()> = parking_lot::const_mutex(());

/// Completion callback; receives the context tag of the sync object.
pub type SyncCallback = Box<dyn FnOnce(ContextTag) + Send>;

#[derive(Default)]
struct SyncState {
    references: u32,
    started: bool,
    completed: bool,
    cleanup: MemList,
    wait: Option<WaitHandle>,
    callback: Option<SyncCallback>,
    parent: Option<SyncHandle>,
}

struct SyncInner {
    state: Mutex<SyncState>,
    ctx: ContextTag,
    /// `None` for core-only objects.
    memory: Option<Arc<MemorySystem>>,
}

/// Shared handle to a sync object.
#[derive(Clone)]
pub struct SyncHandle {
    inner: Arc<SyncInner>,
}

/// State detached under the lock and acted on after it is released.
struct Completion {
    wait: Option<WaitHandle>,
    callback: Option<SyncCallback>,
    parent: Option<SyncHandle>,
    cleanup: MemList,
}

impl SyncHandle {
    /// Sync object without a cleanup list.
    pub fn new_core(ctx: ContextTag) -> Self {
        Self::with_memory(ctx, None)
    }

    /// Sync object whose cleanup list is freed through `memory` on completion.
    pub fn new(ctx: ContextTag, memory: Arc<MemorySystem>) -> Self {
        Self::with_memory(ctx, Some(memory))
    }

    fn with_memory(ctx: ContextTag, memory: Option<Arc<MemorySystem>>) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                state: Mutex::new(SyncState::default()),
                ctx,
                memory,
            }),
        }
    }

    pub fn ctx(&self) -> ContextTag {
        self.inner.ctx
    }

    pub fn is_core_only(&self) -> bool {
        self.inner.memory.is_none()
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().completed
    }

    /// Outstanding references.
    pub fn references(&self) -> u32 {
        self.inner.state.lock().references
    }

    /// Install the completion callback. Only legal before `flush`.
    pub fn set_callback<F>(&self, callback: F) -> Result<(), SyncError>
    where
        F: FnOnce(ContextTag) + Send + 'static,
    {
        let mut st = self.inner.state.lock();
        if st.started {
            return Err(violation(SyncError::AlreadyStarted));
        }
        st.callback = Some(Box::new(callback));
        Ok(())
    }

    /// Free `mem` when this object completes. Only legal before `flush`.
    ///
    /// On error the block is freed right away when a memory system is
    /// attached; a core-only object cannot take ownership and the block stays
    /// allocated until its memory system closes.
    pub fn add_mem_to_free_list(&self, mem: MemHandle) -> Result<(), SyncError> {
        let Some(memory) = &self.inner.memory else {
            warn!(addr = mem.addr(), "memory handed to a core-only sync object is leaked");
            return Err(violation(SyncError::CoreOnly));
        };
        let mut st = self.inner.state.lock();
        if st.started {
            drop(st);
            if let Err(err) = memory.free(mem) {
                error!(error = %err, "failed to free rejected cleanup memory");
            }
            return Err(violation(SyncError::AlreadyStarted));
        }
        st.cleanup.push(mem);
        Ok(())
    }

    /// Wait handle triggered on completion, created on first request.
    pub fn wait_handle(&self) -> Result<WaitHandle, SyncError> {
        let mut st = self.inner.state.lock();
        if st.started {
            return Err(violation(SyncError::WaitHandleUnavailable));
        }
        Ok(st.wait.get_or_insert_with(WaitHandle::new).clone())
    }

    /// Mark the object started; completes at once if nothing is outstanding.
    pub fn flush(&self) -> Result<(), SyncError> {
        let mut st = self.inner.state.lock();
        if st.started {
            return Err(violation(SyncError::AlreadyStarted));
        }
        st.started = true;
        if st.references == 0 {
            self.complete(st);
        }
        Ok(())
    }

    pub fn register_reference(&self) -> Result<(), SyncError> {
        let mut st = self.inner.state.lock();
        if st.completed {
            return Err(violation(SyncError::Completed));
        }
        st.references += 1;
        Ok(())
    }

    /// Drop one reference; the last one after `flush` runs completion on the
    /// calling thread.
    pub fn release_reference(&self) -> Result<(), SyncError> {
        let mut st = self.inner.state.lock();
        if st.references == 0 {
            return Err(violation(SyncError::ReferenceUnderflow));
        }
        st.references -= 1;
        if st.references == 0 && st.started {
            self.complete(st);
        }
        Ok(())
    }

    /// Register a reference released when the returned guard drops.
    pub fn reference(&self) -> Result<SyncReference, SyncError> {
        self.register_reference()?;
        Ok(SyncReference { sync: Some(self.clone()) })
    }

    /// Release one reference from the cleanup worker thread, so completion
    /// runs there instead of on the caller.
    pub fn release_reference_on(&self, worker: &CleanupWorker) -> Result<(), SyncError> {
        let sync = self.clone();
        worker.add_task(move || {
            if let Err(err) = sync.release_reference() {
                error!(error = %err, "deferred release failed");
            }
        })
    }

    /// Make `parent` wait for `child`: the child holds one reference on the
    /// parent until it completes. Both must be unstarted, the child must not
    /// be monitored already and must not already wait, directly or through
    /// its own parents, on `parent`.
    ///
    /// At most one sync object lock is held at any time.
    pub fn add_to_sync_handle(parent: &SyncHandle, child: &SyncHandle) -> Result<(), SyncError> {
        if Arc::ptr_eq(&parent.inner, &child.inner) {
            return Err(violation(SyncError::AlreadyMonitored));
        }
        let attach = ATTACH.lock();
        Self::check_unmonitored(child)?;
        if parent.is_monitored_by(child) {
            return Err(violation(SyncError::WouldCycle));
        }
        {
            let mut parent_st = parent.inner.state.lock();
            if parent_st.started {
                return Err(violation(SyncError::AlreadyStarted));
            }
            parent_st.references += 1;
        }

        let attached = {
            let mut child_st = child.inner.state.lock();
            if child_st.parent.is_some() {
                Err(SyncError::AlreadyMonitored)
            } else if child_st.started {
                Err(SyncError::AlreadyStarted)
            } else {
                child_st.parent = Some(parent.clone());
                Ok(())
            }
        };
        drop(attach);
        if let Err(err) = attached {
            // Lost a race with a flush on the child.
            if let Err(release_err) = parent.release_reference() {
                error!(error = %release_err, "failed to undo parent reference");
            }
            return Err(violation(err));
        }
        Ok(())
    }

    fn check_unmonitored(child: &SyncHandle) -> Result<(), SyncError> {
        let st = child.inner.state.lock();
        if st.parent.is_some() {
            return Err(violation(SyncError::AlreadyMonitored));
        }
        if st.started {
            return Err(violation(SyncError::AlreadyStarted));
        }
        Ok(())
    }

    /// True if `other` is somewhere up this object's parent chain.
    fn is_monitored_by(&self, other: &SyncHandle) -> bool {
        let mut cur = self.inner.state.lock().parent.clone();
        while let Some(next) = cur {
            if Arc::ptr_eq(&next.inner, &other.inner) {
                return true;
            }
            cur = next.inner.state.lock().parent.clone();
        }
        false
    }

    fn complete(&self, mut st: MutexGuard<'_, SyncState>) {
        debug_assert!(st.started && st.references == 0);
        st.completed = true;
        let done = Completion {
            wait: st.wait.take(),
            callback: st.callback.take(),
            parent: st.parent.take(),
            cleanup: std::mem::take(&mut st.cleanup),
        };
        drop(st);

        if let Some(wait) = done.wait {
            wait.trigger();
        }
        if let Some(callback) = done.callback {
            callback(self.inner.ctx);
        }
        if let Some(parent) = done.parent {
            if let Err(err) = parent.release_reference() {
                error!(error = %err, "failed to release parent sync reference");
            }
        }
        if let Some(memory) = &self.inner.memory {
            if !done.cleanup.is_empty() {
                debug!(blocks = done.cleanup.len(), bytes = done.cleanup.total_size(), "freeing sync cleanup list");
                if let Err(err) = memory.free_list(done.cleanup) {
                    error!(error = %err, "failed to free sync cleanup list");
                }
            }
        }
        telemetry::record_sync_completion();
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("SyncHandle")
            .field("ctx", &self.inner.ctx)
            .field("references", &st.references)
            .field("started", &st.started)
            .field("completed", &st.completed)
            .field("core_only", &self.inner.memory.is_none())
            .finish()
    }
}

/// RAII guard that releases one sync reference when dropped.
#[must_use = "the reference is released as soon as the guard drops"]
pub struct SyncReference {
    sync: Option<SyncHandle>,
}

impl SyncReference {
    /// Release now, reporting any error.
    pub fn release(mut self) -> Result<(), SyncError> {
        match self.sync.take() {
            Some(sync) => sync.release_reference(),
            None => Ok(()),
        }
    }
}

impl Drop for SyncReference {
    fn drop(&mut self) {
        if let Some(sync) = self.sync.take() {
            if let Err(err) = sync.release_reference() {
                error!(error = %err, "failed to release sync reference");
            }
        }
    }
}

#[cfg(test)]
#[path = "handle_tests.rs"]
mod tests;
