// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! Memory subsystem error types.
//!
//! Exhaustion and capability mismatches are recoverable: the allocator state is
//! rolled back before any of these are returned.

use thiserror::Error;

/// Errors returned by the bank allocator and heaps.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemError {
    /// Host memory for descriptors or bank metadata is exhausted.
    #[error("Out of host memory")]
    OutOfMemory,

    /// No bank could satisfy the request (rights, order or device capacity).
    #[error("Function failed: {0}")]
    FunctionFailed(String),

    #[error("Zero sized allocations are not supported")]
    ZeroSize,

    /// Caller broke an API contract (double free, foreign handle, ...).
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl MemError {
    /// Returns true if scanning further banks is pointless after this error.
    pub fn aborts_bank_scan(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "out_of_memory",
            Self::FunctionFailed(_) => "function_failed",
            Self::ZeroSize => "zero_size",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }
}

/// Errors reported by a [`MemBackend`](super::MemBackend).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend out of host memory")]
    OutOfHostMemory,

    #[error("Device memory exhausted: requested {requested} bytes, available {available} bytes")]
    DeviceExhausted { requested: u64, available: u64 },

    #[error("Blocks belong to different device regions")]
    RegionMismatch,

    #[error("Blocks are not adjacent")]
    NotAdjacent,

    #[error("Unsupported backend operation: {0}")]
    Unsupported(String),
}

impl From<BackendError> for MemError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::OutOfHostMemory => MemError::OutOfMemory,
            other => MemError::FunctionFailed(other.to_string()),
        }
    }
}

/// Report a contract violation: panics with `strict-invariants`, otherwise
/// logs and hands the error back to the caller.
pub(crate) fn violation(msg: impl Into<String>) -> MemError {
    let msg = msg.into();
    if cfg!(feature = "strict-invariants") {
        panic!("memory invariant violated: {msg}");
    }
    tracing::error!(%msg, "memory invariant violated");
    MemError::InvariantViolation(msg)
}
