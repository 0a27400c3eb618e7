//! Sync object error types.

use thiserror::Error;

/// Sequencing errors on sync objects and worker failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Sync object already started")]
    AlreadyStarted,

    #[error("Sync object already completed")]
    Completed,

    #[error("Reference count underflow")]
    ReferenceUnderflow,

    #[error("Sync object is already monitored by another sync object")]
    AlreadyMonitored,

    #[error("Monitoring would create a dependency cycle")]
    WouldCycle,

    #[error("Cleanup lists are not supported on core-only sync objects")]
    CoreOnly,

    #[error("Wait handle requested after start")]
    WaitHandleUnavailable,

    #[error("Cleanup worker has shut down")]
    WorkerStopped,

    #[error("Failed to spawn cleanup worker: {0}")]
    WorkerSpawn(String),
}

impl SyncError {
    /// True for caller sequencing bugs as opposed to runtime failures.
    pub fn is_violation(&self) -> bool {
        !matches!(self, Self::WorkerStopped | Self::WorkerSpawn(_))
    }
}

/// Report a sequencing violation: panics with `strict-invariants`, otherwise
/// logs and hands the error back.
pub(crate) fn violation(err: SyncError) -> SyncError {
    if cfg!(feature = "strict-invariants") {
        panic!("sync invariant violated: {err}");
    }
    tracing::error!(error = %err, "sync invariant violated");
    err
}
