// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

use std::sync::Arc;

use super::*;
use crate::mem::backend::MockBackend;
use crate::mem::order::{normalize_alignment, pad_size};

const BASE: u64 = 1 << 32;

fn setup() -> (Arc<MockBackend>, DescriptorPool, Bank) {
    let backend = Arc::new(MockBackend::single_bank(1 << 20, 20));
    let info = backend.capability_sets().unwrap().remove(0);
    let pool = DescriptorPool::new(backend.clone(), 16);
    (backend, pool, Bank::new(0, info))
}

fn try_alloc(
    bank: &Bank,
    pool: &DescriptorPool,
    backend: &MockBackend,
    size: u32,
    alignment: u32,
) -> Result<MemHandle, MemError> {
    bank.allocate(
        1,
        pad_size(size),
        size,
        normalize_alignment(alignment),
        MemRights::GP_READ,
        pool,
        backend,
    )
}

fn alloc(bank: &Bank, pool: &DescriptorPool, backend: &MockBackend, size: u32, alignment: u32) -> MemHandle {
    try_alloc(bank, pool, backend, size, alignment).unwrap()
}

fn block(start: u64, size: u32, allocated: bool) -> BlockInfo {
    BlockInfo { start, size, allocated }
}

#[test]
fn fresh_allocation_splits_off_tail() {
    let (backend, pool, bank) = setup();
    let h = alloc(&bank, &pool, &backend, 100, 1);
    assert_eq!(h.addr(), BASE);
    assert_eq!(h.size(), 128);
    assert_eq!(bank.layout(), vec![block(BASE, 128, true), block(BASE + 128, 64, false)]);
    let stats = bank.stats();
    assert_eq!(stats.size_allocated, 128);
    assert_eq!(stats.bytes_requested, 100);
    assert_eq!(stats.free_list_size, 64);
    bank.validate().unwrap();
}

#[test]
fn free_without_holdback_releases_whole_region() {
    let (backend, pool, bank) = setup();
    let h = alloc(&bank, &pool, &backend, 4096, 1);
    assert_eq!(backend.device_bytes_in_use(), 4160);
    bank.free(h.index, &pool, &*backend).unwrap();
    assert!(bank.layout().is_empty());
    assert_eq!(backend.live_regions(), 0);
    assert_eq!(bank.stats().free_list_size, 0);
    bank.validate().unwrap();
}

#[test]
fn holdback_keeps_freed_block_for_reuse() {
    let (backend, pool, bank) = setup();
    let h = alloc(&bank, &pool, &backend, 4096, 1);
    bank.new_period(16 << 20);
    assert_eq!(bank.stats().holdback_size, 4096 + 512);

    bank.free(h.index, &pool, &*backend).unwrap();
    assert_eq!(bank.layout(), vec![block(BASE, 4160, false)]);
    assert_eq!(backend.live_regions(), 1);

    let again = alloc(&bank, &pool, &backend, 4096, 1);
    assert_eq!(again.addr(), BASE);
    assert_eq!(backend.live_regions(), 1);
    bank.validate().unwrap();
}

#[test]
fn aligned_request_splits_head_and_tail() {
    let (backend, pool, bank) = setup();
    let _a = alloc(&bank, &pool, &backend, 64, 1);
    let b = alloc(&bank, &pool, &backend, 64, 1024);
    assert_eq!(b.addr(), BASE + 1024);
    assert_eq!(b.alignment(), 1024);
    assert_eq!(
        bank.layout(),
        vec![
            block(BASE, 64, true),
            block(BASE + 64, 64, false),
            block(BASE + 128, 896, false),
            block(BASE + 1024, 64, true),
            block(BASE + 1088, 128, false),
        ]
    );
    bank.validate().unwrap();

    bank.free(b.index, &pool, &*backend).unwrap();
    assert_eq!(bank.layout(), vec![block(BASE, 64, true), block(BASE + 64, 64, false)]);
    assert_eq!(backend.live_regions(), 1);
    bank.validate().unwrap();
}

#[test]
fn failed_tail_split_rolls_back_fresh_block() {
    let (backend, pool, bank) = setup();
    let _a = alloc(&bank, &pool, &backend, 64, 1);
    let before = bank.layout();

    backend.fail_resize_in(1);
    let result = try_alloc(&bank, &pool, &backend, 64, 1024);
    assert!(matches!(result, Err(MemError::FunctionFailed(_))));
    assert_eq!(bank.layout(), before);
    assert_eq!(backend.live_regions(), 1);
    bank.validate().unwrap();
}

#[test]
fn descriptor_exhaustion_is_out_of_memory() {
    let (backend, pool, bank) = setup();
    let _a = alloc(&bank, &pool, &backend, 100, 1);
    let before = bank.layout();

    backend.set_descriptor_budget(Some(backend.descriptors_outstanding() + 1));
    let result = try_alloc(&bank, &pool, &backend, 4096, 1);
    assert_eq!(result.err(), Some(MemError::OutOfMemory));
    assert_eq!(bank.layout(), before);
    assert_eq!(backend.live_regions(), 1);
    bank.validate().unwrap();
}

#[test]
fn device_exhaustion_is_function_failed() {
    let (backend, pool, bank) = setup();
    backend.fail_next_get_memory(1);
    let result = try_alloc(&bank, &pool, &backend, 64, 1);
    assert!(matches!(result, Err(MemError::FunctionFailed(_))));
    assert!(bank.layout().is_empty());
}

#[cfg(not(feature = "strict-invariants"))]
#[test]
fn double_free_is_reported() {
    let (backend, pool, bank) = setup();
    let h = alloc(&bank, &pool, &backend, 64, 1);
    bank.new_period(16 << 20);
    let idx = h.index;
    bank.free(idx, &pool, &*backend).unwrap();
    let second = bank.free(idx, &pool, &*backend);
    assert!(matches!(second, Err(MemError::InvariantViolation(_))));
    bank.validate().unwrap();
}

#[test]
fn holdback_margin_is_capped() {
    let (backend, pool, bank) = setup();
    let _h = alloc(&bank, &pool, &backend, 4096, 1);
    bank.new_period(100);
    assert_eq!(bank.stats().holdback_size, 4196);
}

#[test]
fn holdback_forgets_peak_after_history_window() {
    let (backend, pool, bank) = setup();
    let h = alloc(&bank, &pool, &backend, 4096, 1);
    bank.free(h.index, &pool, &*backend).unwrap();
    for _ in 0..HISTORY_PERIODS {
        bank.new_period(16 << 20);
    }
    assert_eq!(bank.stats().holdback_size, 4608);
    bank.new_period(16 << 20);
    assert_eq!(bank.stats().holdback_size, 0);
}

#[test]
fn free_unused_evicts_partial_blocks() {
    let (backend, pool, bank) = setup();
    let h = alloc(&bank, &pool, &backend, 100, 1);
    assert_eq!(bank.free_unused(&pool, &*backend), 64);
    assert_eq!(bank.layout(), vec![block(BASE, 128, true)]);
    assert_eq!(backend.live_regions(), 1);

    // No longer a whole region, so it stays on the free list.
    bank.free(h.index, &pool, &*backend).unwrap();
    assert_eq!(bank.layout(), vec![block(BASE, 128, false)]);
    assert_eq!(bank.free_unused(&pool, &*backend), 128);
    assert_eq!(backend.live_regions(), 0);
    bank.validate().unwrap();
}

#[test]
fn destroy_counts_leaks_and_releases_everything() {
    let (backend, pool, bank) = setup();
    let _a = alloc(&bank, &pool, &backend, 100, 1);
    let _b = alloc(&bank, &pool, &backend, 4096, 1);
    assert_eq!(bank.destroy(&pool, &*backend), 2);
    assert_eq!(backend.live_regions(), 0);
    assert!(bank.layout().is_empty());
    assert_eq!(bank.stats().size_allocated, 0);
}

#[test]
fn bank_rejects_wrong_rights_and_large_orders() {
    let (_backend, _pool, bank) = setup();
    assert!(bank.accepts(20, MemRights::GP_READ | MemRights::CPU_WRITE));
    assert!(!bank.accepts(21, MemRights::GP_READ));
    assert!(!bank.accepts(6, MemRights::from_bits(1 << 7)));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "free list accounting drifted")]
fn drifted_free_list_counter_is_caught() {
    let (backend, pool, bank) = setup();
    let h = alloc(&bank, &pool, &backend, 100, 1);
    bank.state.lock().free_list_size += 64;
    // Merging with the free tail unlinks it and rechecks the counter.
    let _ = bank.free(h.index, &pool, &*backend);
}
