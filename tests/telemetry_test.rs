//! Logging initialization and metrics recording without a recorder.

use gpu_base::mem::{MemRights, MemorySystem, MockBackend};
use gpu_base::telemetry::{
    init_logging, record_alloc_failure, record_bank_usage, record_sync_completion, LogConfig, LogError,
    LogFormat,
};
use gpu_base::{ContextTag, MemConfig};
use std::sync::Arc;

// The global subscriber can only be installed once per process, so every
// initialization case lives in this single test.
#[test]
fn init_logging_lifecycle() {
    let bad = LogConfig {
        level: "gpu_base=notalevel".to_string(),
        ..LogConfig::default()
    };
    assert!(matches!(init_logging(&bad), Err(LogError::InvalidFilter(_))));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpu-base.log");
    let config = LogConfig {
        format: LogFormat::Json,
        level: "gpu_base=debug".to_string(),
        output_path: Some(path.clone()),
    };
    init_logging(&config).unwrap();
    assert!(path.exists());

    // Allocator activity goes through the installed subscriber.
    let backend = Arc::new(MockBackend::single_bank(1 << 20, 20));
    let system = MemorySystem::open(backend, MemConfig::default()).unwrap();
    let mem = system.alloc(ContextTag::NONE, 4096, 1, MemRights::GP_WRITE).unwrap();
    system.free(mem).unwrap();
    system.new_period();
    system.close();

    assert!(matches!(init_logging(&config), Err(LogError::AlreadyInitialized)));
}

#[test]
fn metrics_without_recorder_are_noops() {
    let backend = Arc::new(MockBackend::single_bank(1 << 20, 20));
    let system = MemorySystem::open(backend, MemConfig::default()).unwrap();
    for bank in system.banks() {
        record_bank_usage(&bank.stats());
    }
    record_alloc_failure("out_of_memory");
    record_sync_completion();
}
