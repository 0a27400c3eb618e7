//! Telemetry: structured logging setup and metrics recording.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{record_alloc_failure, record_bank_usage, record_sync_completion};
