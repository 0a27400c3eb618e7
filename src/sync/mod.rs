//! Sync/completion objects.
//!
//! A [`SyncHandle`] tracks a set of in-flight jobs. Each job holds a
//! reference; once the producer has flushed the object and the last reference
//! is released, the completion routine runs exactly once.

mod error;
mod handle;
mod wait;
mod worker;

pub use error::SyncError;
pub use handle::{SyncCallback, SyncHandle, SyncReference};
pub use wait::WaitHandle;
pub use worker::CleanupWorker;
