//! Dedicated thread for deferred cleanup work.
//!
//! Tasks run one at a time in submission order. Shutdown drains every task
//! already queued before the thread exits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use super::error::SyncError;

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

/// FIFO task queue served by one background thread.
pub struct CleanupWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl CleanupWorker {
    pub fn spawn(name: &str) -> Result<Self, SyncError> {
        let shared = Arc::new(Shared::default());
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn({
                let shared = shared.clone();
                move || Self::run(&shared)
            })
            .map_err(|e| SyncError::WorkerSpawn(e.to_string()))?;
        debug!(name, "cleanup worker started");
        Ok(Self { shared, thread: Some(thread) })
    }

    fn run(shared: &Shared) {
        loop {
            let task = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }
                    if queue.stopping {
                        return;
                    }
                    shared.cond.wait(&mut queue);
                }
            };
            task();
        }
    }

    /// Queue `task` behind everything already submitted.
    pub fn add_task<F>(&self, task: F) -> Result<(), SyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.stopping {
            return Err(SyncError::WorkerStopped);
        }
        queue.tasks.push_back(Box::new(task));
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Stop accepting work, run what is queued and join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stopping = true;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("cleanup worker panicked");
            }
        }
    }
}

impl Drop for CleanupWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_in_order() {
        let worker = CleanupWorker::spawn("test-cleanup").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            worker.add_task(move || log.lock().push(i)).unwrap();
        }
        worker.shutdown();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_queue() {
        let worker = CleanupWorker::spawn("test-drain").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = count.clone();
            worker
                .add_task(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        drop(worker);
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }
}
