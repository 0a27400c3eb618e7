//! Metrics recording through the `metrics` facade.
//!
//! No recorder is installed here; without one every call is a no-op.

use metrics::{counter, gauge};

use crate::mem::BankStats;

/// Publish one bank's accounting as gauges.
pub fn record_bank_usage(stats: &BankStats) {
    let bank = stats.bank.to_string();
    gauge!("gpu_base_bank_allocated_bytes", "bank" => bank.clone()).set(stats.size_allocated as f64);
    gauge!("gpu_base_bank_free_list_bytes", "bank" => bank.clone()).set(stats.free_list_size as f64);
    gauge!("gpu_base_bank_holdback_bytes", "bank" => bank).set(stats.holdback_size as f64);
}

/// Count a failed allocation by error kind.
pub fn record_alloc_failure(kind: &'static str) {
    counter!("gpu_base_alloc_failures_total", "kind" => kind).increment(1);
}

pub fn record_sync_completion() {
    counter!("gpu_base_sync_completions_total").increment(1);
}
