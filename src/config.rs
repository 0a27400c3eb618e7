//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `GPU_BASE_*` environment variables
//! with sensible defaults. Invalid values fall back to defaults without crashing.
//! A [`MemorySystem`](crate::mem::MemorySystem) takes its [`MemConfig`] at open;
//! later environment changes do not affect a running system.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GPU_BASE_DESCRIPTOR_POOL` | 16 | Block descriptors kept for reuse |
//! | `GPU_BASE_HOLDBACK_CAP` | 16777216 | Max holdback margin per bank (bytes) |
//! | `GPU_BASE_HEAP_ALIGNMENT` | 1024 | Alignment of heap blocks (bytes) |
//! | `GPU_BASE_LOG_LEVEL` | info | `tracing` filter directive |
//! | `GPU_BASE_LOG_FORMAT` | json | `json` or `pretty` |

use crate::mem::order::GRANULE;
use crate::telemetry::{LogConfig, LogFormat};

/// Allocator tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemConfig {
    /// Descriptors the pool keeps around; the pool is filled to this at open.
    pub descriptor_pool_capacity: usize,
    /// Upper bound on the margin added to a bank's historical peak. The peak
    /// window is fixed at [`HISTORY_PERIODS`](crate::mem::HISTORY_PERIODS).
    pub holdback_margin_cap: u64,
    pub heap_alignment: u32,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            descriptor_pool_capacity: 16,
            holdback_margin_cap: 16 * 1024 * 1024,
            heap_alignment: 1024,
        }
    }
}

/// All configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub mem: MemConfig,
    pub log: LogConfig,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load allocator configuration from environment.
pub fn load_mem_config() -> MemConfig {
    let defaults = MemConfig::default();
    let pool = parse_usize("GPU_BASE_DESCRIPTOR_POOL", defaults.descriptor_pool_capacity);
    let cap = parse_u64("GPU_BASE_HOLDBACK_CAP", defaults.holdback_margin_cap);
    let alignment = parse_u32("GPU_BASE_HEAP_ALIGNMENT", defaults.heap_alignment);
    let pool = pool.clamp(1, 4096);
    let alignment = alignment
        .max(GRANULE)
        .checked_next_power_of_two()
        .unwrap_or(defaults.heap_alignment);
    MemConfig {
        descriptor_pool_capacity: pool,
        holdback_margin_cap: cap,
        heap_alignment: alignment,
        ..defaults
    }
}

/// Load logging configuration from environment.
pub fn load_log_config() -> LogConfig {
    let mut log = LogConfig::default();
    if let Ok(level) = std::env::var("GPU_BASE_LOG_LEVEL") {
        if !level.trim().is_empty() {
            log.level = level;
        }
    }
    if let Ok(format) = std::env::var("GPU_BASE_LOG_FORMAT") {
        log.format = match format.to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
    }
    log
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    EnvConfig { mem: load_mem_config(), log: load_log_config() }
}
