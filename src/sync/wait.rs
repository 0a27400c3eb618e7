//! One-shot wait handles signalled when a sync object completes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct WaitInner {
    triggered: Mutex<bool>,
    cond: Condvar,
}

/// Cloneable handle that blocks until triggered.
///
/// Storage is reclaimed when the last clone drops, whether or not anyone
/// waited on it.
#[derive(Clone, Default)]
pub struct WaitHandle {
    inner: Arc<WaitInner>,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter. Later waits return immediately.
    pub fn trigger(&self) {
        let mut triggered = self.inner.triggered.lock();
        *triggered = true;
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Block until triggered.
    pub fn wait(&self) {
        let mut triggered = self.inner.triggered.lock();
        while !*triggered {
            self.inner.cond.wait(&mut triggered);
        }
    }

    /// Block until triggered or `timeout` passes. Returns true if triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.inner.triggered.lock();
        while !*triggered {
            if self.inner.cond.wait_until(&mut triggered, deadline).timed_out() {
                break;
            }
        }
        *triggered
    }
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle").field("triggered", &self.is_triggered()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn trigger_wakes_waiter() {
        let handle = WaitHandle::new();
        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.wait())
        };
        handle.trigger();
        waiter.join().unwrap();
        assert!(handle.is_triggered());
    }

    #[test]
    fn wait_timeout_without_trigger() {
        let handle = WaitHandle::new();
        assert!(!handle.wait_timeout(Duration::from_millis(10)));
        handle.trigger();
        assert!(handle.wait_timeout(Duration::from_millis(10)));
    }
}
