// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! The memory system: bank registry, allocation entry points and usage
//! accounting.
//!
//! A `MemorySystem` owns every bank discovered from one backend plus the
//! shared descriptor pool. Several systems may live in one process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::MemBackend;
use super::bank::{Bank, BankStats, BlockInfo};
use super::block::{MemHandle, MemList};
use super::descriptor::DescriptorPool;
use super::error::{violation, MemError};
use super::order::{normalize_alignment, order_of, pad_size, MIN_ORDER};
use super::rights::MemRights;
use crate::config::MemConfig;
use crate::telemetry;
use crate::ContextTag;

static NEXT_SYSTEM_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot of allocator usage across all banks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemStats {
    pub banks: Vec<BankStats>,
    pub current_bytes_requested: u64,
    pub max_bytes_requested: u64,
    pub current_bytes_allocated: u64,
    pub max_bytes_allocated: u64,
    pub period: u64,
}

#[derive(Default)]
struct UsageCounters {
    requested: AtomicU64,
    max_requested: AtomicU64,
    allocated: AtomicU64,
    max_allocated: AtomicU64,
}

impl UsageCounters {
    fn on_alloc(&self, allocated: u32, requested: u32) {
        let r = self.requested.fetch_add(requested.into(), Ordering::Relaxed) + u64::from(requested);
        self.max_requested.fetch_max(r, Ordering::Relaxed);
        let a = self.allocated.fetch_add(allocated.into(), Ordering::Relaxed) + u64::from(allocated);
        self.max_allocated.fetch_max(a, Ordering::Relaxed);
    }

    fn on_free(&self, allocated: u32, requested: u32) {
        self.requested.fetch_sub(requested.into(), Ordering::Relaxed);
        self.allocated.fetch_sub(allocated.into(), Ordering::Relaxed);
    }
}

/// Bank registry and allocator context.
pub struct MemorySystem {
    id: u64,
    backend: Arc<dyn MemBackend>,
    pool: DescriptorPool,
    banks: Vec<Bank>,
    config: MemConfig,
    period: AtomicU64,
    usage: UsageCounters,
    closed: AtomicBool,
}

impl MemorySystem {
    /// Open the backend, discover its banks and prefill the descriptor pool.
    pub fn open(backend: Arc<dyn MemBackend>, config: MemConfig) -> Result<Self, MemError> {
        backend.open()?;
        match Self::register(backend.clone(), config) {
            Ok(system) => Ok(system),
            Err(err) => {
                backend.close();
                Err(err)
            }
        }
    }

    fn register(backend: Arc<dyn MemBackend>, config: MemConfig) -> Result<Self, MemError> {
        if backend.num_capability_sets() == 0 {
            return Err(MemError::FunctionFailed("backend reports no capability sets".into()));
        }
        let sets = backend.capability_sets()?;

        let pool = DescriptorPool::new(backend.clone(), config.descriptor_pool_capacity);
        pool.prefill()?;

        let mut banks = Vec::with_capacity(sets.len());
        for info in sets {
            if info.maximum_order < MIN_ORDER {
                debug!(
                    maximum_order = info.maximum_order,
                    rights = %info.capabilities,
                    "skipping bank below minimum order"
                );
                continue;
            }
            backend.init_bank(&info)?;
            debug!(
                bank = banks.len(),
                rights = %info.capabilities,
                size = info.size,
                maximum_order = info.maximum_order,
                "registered bank"
            );
            banks.push(Bank::new(banks.len(), info));
        }
        if banks.is_empty() {
            return Err(MemError::FunctionFailed("no usable bank".into()));
        }

        let id = NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed);
        info!(system = id, banks = banks.len(), "memory system opened");
        Ok(Self {
            id,
            backend,
            pool,
            banks,
            config,
            period: AtomicU64::new(0),
            usage: UsageCounters::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Tear down every bank. Returns the number of allocations still live,
    /// which are logged and force-released.
    pub fn close(self) -> usize {
        self.teardown()
    }

    fn teardown(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let leaked: usize = self
            .banks
            .iter()
            .map(|bank| bank.destroy(&self.pool, &*self.backend))
            .sum();
        if leaked > 0 {
            warn!(system = self.id, leaked, "memory system closed with live allocations");
        }
        self.pool.release_all();
        self.backend.close();
        leaked
    }

    /// Allocate `size` bytes from the first bank offering `rights`.
    ///
    /// `ctx` identifies the calling context; the allocator does not act on it.
    pub fn alloc(
        &self,
        ctx: ContextTag,
        size: u32,
        alignment: u32,
        rights: MemRights,
    ) -> Result<MemHandle, MemError> {
        if size == 0 {
            return Err(MemError::ZeroSize);
        }
        let padded = pad_size(size);
        if padded < size {
            return Err(MemError::FunctionFailed(format!("request of {size} bytes is too large")));
        }
        let alignment = normalize_alignment(alignment);
        let order = order_of(padded);

        let mut last_err = None;
        for bank in &self.banks {
            if !bank.accepts(order, rights) {
                continue;
            }
            match bank.allocate(self.id, padded, size, alignment, rights, &self.pool, &*self.backend) {
                Ok(mem) => {
                    self.usage.on_alloc(mem.size(), size);
                    return Ok(mem);
                }
                Err(err) if err.aborts_bank_scan() => {
                    return Err(self.alloc_failed(ctx, size, err));
                }
                Err(err) => {
                    debug!(bank = bank.id(), error = %err, "bank could not serve request");
                    last_err = Some(err);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            MemError::FunctionFailed(format!("no bank offers rights {rights} at order {order}"))
        });
        Err(self.alloc_failed(ctx, size, err))
    }

    fn alloc_failed(&self, ctx: ContextTag, size: u32, err: MemError) -> MemError {
        debug!(system = self.id, ctx = ctx.0, size, error = %err, "allocation failed");
        telemetry::record_alloc_failure(err.kind());
        err
    }

    /// Return an allocation to its bank.
    pub fn free(&self, mem: MemHandle) -> Result<(), MemError> {
        if mem.system != self.id {
            return Err(violation("handle belongs to another memory system"));
        }
        let Some(bank) = self.banks.get(mem.bank) else {
            return Err(violation(format!("handle names unknown bank {}", mem.bank)));
        };
        bank.free(mem.index, &self.pool, &*self.backend)?;
        self.usage.on_free(mem.size(), mem.requested_size());
        Ok(())
    }

    /// Free every allocation on `list`. All entries are attempted; the first
    /// error is returned.
    pub fn free_list(&self, list: MemList) -> Result<(), MemError> {
        let mut first_err = None;
        for mem in list {
            if let Err(err) = self.free(mem) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Close the current accounting period on every bank.
    pub fn new_period(&self) {
        for bank in &self.banks {
            bank.new_period(self.config.holdback_margin_cap);
            telemetry::record_bank_usage(&bank.stats());
        }
        self.period.fetch_add(1, Ordering::Relaxed);
    }

    /// Release every free-listed block to the device and drain the descriptor
    /// pool. Returns the number of bytes released.
    pub fn free_unused_memory(&self) -> u64 {
        let released = self
            .banks
            .iter()
            .map(|bank| bank.free_unused(&self.pool, &*self.backend))
            .sum();
        self.pool.release_all();
        debug!(system = self.id, released, "released unused memory");
        released
    }

    /// Bytes currently allocated across all banks.
    pub fn total_allocated_size(&self) -> u64 {
        self.banks.iter().map(|bank| bank.stats().size_allocated).sum()
    }

    pub fn stats(&self) -> MemStats {
        MemStats {
            banks: self.banks.iter().map(Bank::stats).collect(),
            current_bytes_requested: self.usage.requested.load(Ordering::Relaxed),
            max_bytes_requested: self.usage.max_requested.load(Ordering::Relaxed),
            current_bytes_allocated: self.usage.allocated.load(Ordering::Relaxed),
            max_bytes_allocated: self.usage.max_allocated.load(Ordering::Relaxed),
            period: self.period.load(Ordering::Relaxed),
        }
    }

    /// Address-ordered block layout of bank `bank`.
    pub fn bank_layout(&self, bank: usize) -> Option<Vec<BlockInfo>> {
        self.banks.get(bank).map(Bank::layout)
    }

    /// Check the partition and accounting invariants of every bank.
    pub fn validate(&self) -> Result<(), MemError> {
        self.banks.iter().try_for_each(Bank::validate)
    }

    pub fn log_usage_map(&self) {
        for bank in &self.banks {
            bank.log_usage_map();
        }
    }

    pub fn banks(&self) -> &[Bank] {
        &self.banks
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for MemorySystem {
    fn drop(&mut self) {
        self.teardown();
    }
}
