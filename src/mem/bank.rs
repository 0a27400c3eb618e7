// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! A single memory bank: block bookkeeping, per-order free lists, split and
//! merge, and the holdback tracker deciding how much freed memory to keep.
//!
//! Lock order: a bank lock may be held while taking the descriptor pool lock.
//! Fresh device memory is requested with the bank lock released.

use std::collections::BTreeMap;

use generational_arena::{Arena, Index};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::backend::{BankInfo, MemBackend};
use super::block::{BlockDescriptor, FreeSlot, FreeTier, MemHandle};
use super::descriptor::DescriptorPool;
use super::error::{violation, BackendError, MemError};
use super::order::{alignment_correction, order_of, GRANULE, MIN_ORDER};
use super::rights::MemRights;

/// Number of accounting periods the holdback tracker remembers.
pub const HISTORY_PERIODS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct FreeList {
    head: Option<Index>,
    tail: Option<Index>,
}

/// Point-in-time accounting for one bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BankStats {
    pub bank: usize,
    pub rights: MemRights,
    pub order_min: u8,
    pub order_max: u8,
    pub size_total: u64,
    pub size_allocated: u64,
    pub bytes_requested: u64,
    pub free_list_size: u64,
    pub holdback_size: u64,
    pub blocks: usize,
    pub free_blocks: usize,
}

/// One block as seen by [`Bank::layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub start: u64,
    pub size: u32,
    pub allocated: bool,
}

pub(crate) struct BankState {
    order_min: u8,
    order_max: u8,
    blocks: Arena<Box<BlockDescriptor>>,
    /// Every live block keyed by start address.
    all_memory: BTreeMap<u64, Index>,
    exact: Vec<FreeList>,
    bigger: Vec<FreeList>,
    size_allocated: u64,
    bytes_requested: u64,
    free_list_size: u64,
    holdback_size: u64,
    past_size_allocated: [u64; HISTORY_PERIODS],
    period: usize,
}

impl BankState {
    fn new(order_min: u8, order_max: u8) -> Self {
        let orders = usize::from(order_max - order_min) + 1;
        Self {
            order_min,
            order_max,
            blocks: Arena::new(),
            all_memory: BTreeMap::new(),
            exact: vec![FreeList::default(); orders],
            bigger: vec![FreeList::default(); orders],
            size_allocated: 0,
            bytes_requested: 0,
            free_list_size: 0,
            holdback_size: 0,
            past_size_allocated: [0; HISTORY_PERIODS],
            period: 0,
        }
    }

    fn slot_for(&self, d: &BlockDescriptor) -> FreeSlot {
        if d.is_pow2 {
            FreeSlot { tier: FreeTier::Exact, index: usize::from(d.order.saturating_sub(self.order_min)) }
        } else {
            let order = d.order.min(self.order_max);
            FreeSlot { tier: FreeTier::Bigger, index: usize::from(order.saturating_sub(self.order_min)) }
        }
    }

    fn list_mut(&mut self, slot: FreeSlot) -> &mut FreeList {
        match slot.tier {
            FreeTier::Exact => &mut self.exact[slot.index],
            FreeTier::Bigger => &mut self.bigger[slot.index],
        }
    }

    /// Append a block to the tail of its free list.
    fn push_free(&mut self, idx: Index) {
        let (slot, size) = {
            let d = &self.blocks[idx];
            (self.slot_for(d), d.size)
        };
        let tail = self.list_mut(slot).tail;
        match tail {
            Some(t) => self.blocks[t].free_next = Some(idx),
            None => self.list_mut(slot).head = Some(idx),
        }
        let d = &mut self.blocks[idx];
        d.free_slot = Some(slot);
        d.free_prev = tail;
        d.free_next = None;
        self.list_mut(slot).tail = Some(idx);
        self.free_list_size += u64::from(size);
        #[cfg(debug_assertions)]
        self.check_free_size();
    }

    /// Remove a block from whatever free list holds it.
    fn unlink_free(&mut self, idx: Index) {
        let (slot, prev, next, size) = {
            let d = &mut self.blocks[idx];
            let Some(slot) = d.free_slot.take() else {
                return;
            };
            (slot, d.free_prev.take(), d.free_next.take(), d.size)
        };
        match prev {
            Some(p) => self.blocks[p].free_next = next,
            None => self.list_mut(slot).head = next,
        }
        match next {
            Some(n) => self.blocks[n].free_prev = prev,
            None => self.list_mut(slot).tail = prev,
        }
        self.free_list_size -= u64::from(size);
        #[cfg(debug_assertions)]
        self.check_free_size();
    }

    /// Sum of every block reachable from the free lists.
    #[cfg(debug_assertions)]
    fn recompute_free_size(&self) -> u64 {
        let mut total = 0;
        for list in self.exact.iter().chain(&self.bigger) {
            let mut cur = list.head;
            while let Some(idx) = cur {
                let d = &self.blocks[idx];
                total += u64::from(d.size);
                cur = d.free_next;
            }
        }
        total
    }

    #[cfg(debug_assertions)]
    fn check_free_size(&self) {
        debug_assert_eq!(self.free_list_size, self.recompute_free_size(), "free list accounting drifted");
    }

    /// First free block that still covers `size` once aligned.
    fn find_free(&self, size: u32, alignment: u32, order: u8) -> Option<Index> {
        for o in order..=self.order_max {
            let i = usize::from(o - self.order_min);
            for list in [&self.exact[i], &self.bigger[i]] {
                let mut cur = list.head;
                while let Some(idx) = cur {
                    let d = &self.blocks[idx];
                    let correction = alignment_correction(d.start, alignment);
                    if u64::from(d.size) >= u64::from(size) + correction {
                        return Some(idx);
                    }
                    cur = d.free_next;
                }
            }
        }
        None
    }

    fn link(&mut self, descriptor: Box<BlockDescriptor>) -> Index {
        let start = descriptor.start;
        let idx = self.blocks.insert(descriptor);
        self.all_memory.insert(start, idx);
        idx
    }

    /// Take a block out of every list and hand its descriptor back.
    fn detach(&mut self, idx: Index) -> Option<Box<BlockDescriptor>> {
        self.unlink_free(idx);
        let d = self.blocks.remove(idx)?;
        if self.all_memory.get(&d.start) == Some(&idx) {
            self.all_memory.remove(&d.start);
        }
        Some(d)
    }

    fn free_neighbor_before(&self, idx: Index) -> Option<Index> {
        let d = &self.blocks[idx];
        let (_, &p) = self.all_memory.range(..d.start).next_back()?;
        let pd = &self.blocks[p];
        (!pd.allocated && pd.region == d.region && pd.end() == d.start).then_some(p)
    }

    fn free_neighbor_after(&self, idx: Index) -> Option<Index> {
        let d = &self.blocks[idx];
        let (_, &n) = self.all_memory.range(d.start + 1..).next()?;
        let nd = &self.blocks[n];
        (!nd.allocated && nd.region == d.region && d.end() == nd.start).then_some(n)
    }

    /// Fold `upper` into `lower`. Neither block may be on a free list.
    fn merge(
        &mut self,
        lower: Index,
        upper: Index,
        pool: &DescriptorPool,
        backend: &dyn MemBackend,
    ) -> Result<(), BackendError> {
        let (Some(a), Some(b)) = self.blocks.get2_mut(lower, upper) else {
            return Err(BackendError::Unsupported("stale block index".into()));
        };
        let upper_start = b.start;
        let moved = i64::from(b.size);
        backend.resize_blocks(a, b, moved)?;
        a.size_changed(self.order_max);
        self.all_memory.remove(&upper_start);
        if let Some(b) = self.blocks.remove(upper) {
            pool.release(b);
        }
        Ok(())
    }

    /// Trim block `idx` to exactly `size` bytes at an `alignment` boundary,
    /// putting the surplus pieces on the free lists.
    ///
    /// On failure every piece split off so far is merged back and the index
    /// of the surviving block is returned with the error.
    fn split(
        &mut self,
        idx: Index,
        size: u32,
        alignment: u32,
        pool: &DescriptorPool,
        backend: &dyn MemBackend,
    ) -> Result<(), (MemError, Index)> {
        let start = self.blocks[idx].start;
        let before = alignment_correction(start, alignment) as u32;
        let mut head = None;

        if before > 0 {
            let Some(mut pre) = pool.get() else {
                return Err((MemError::OutOfMemory, idx));
            };
            let mem = &mut self.blocks[idx];
            if let Err(err) = backend.resize_blocks(&mut pre, mem, i64::from(before)) {
                pool.release(pre);
                return Err((err.into(), idx));
            }
            mem.size_changed(self.order_max);
            pre.size_changed(self.order_max);
            let mem_start = mem.start;
            let pre_idx = self.blocks.insert(pre);
            self.all_memory.insert(start, pre_idx);
            self.all_memory.insert(mem_start, idx);
            self.push_free(pre_idx);
            head = Some(pre_idx);
        }

        let after = self.blocks[idx].size - size;
        if after >= GRANULE {
            let Some(mut post) = pool.get() else {
                return Err((MemError::OutOfMemory, self.undo_head(head, idx, pool, backend)));
            };
            let mem = &mut self.blocks[idx];
            if let Err(err) = backend.resize_blocks(mem, &mut post, -i64::from(after)) {
                pool.release(post);
                return Err((err.into(), self.undo_head(head, idx, pool, backend)));
            }
            mem.size_changed(self.order_max);
            post.size_changed(self.order_max);
            let post_idx = self.link(post);
            self.push_free(post_idx);
        }
        Ok(())
    }

    fn undo_head(
        &mut self,
        head: Option<Index>,
        idx: Index,
        pool: &DescriptorPool,
        backend: &dyn MemBackend,
    ) -> Index {
        let Some(pre_idx) = head else {
            return idx;
        };
        self.unlink_free(pre_idx);
        match self.merge(pre_idx, idx, pool, backend) {
            Ok(()) => pre_idx,
            Err(err) => {
                warn!(error = %err, "could not merge split head back, keeping it free");
                self.push_free(pre_idx);
                idx
            }
        }
    }

    fn note_peak(&mut self) {
        let slot = &mut self.past_size_allocated[self.period];
        *slot = (*slot).max(self.size_allocated);
    }
}

/// A registered memory source with one set of capability rights.
pub struct Bank {
    id: usize,
    info: BankInfo,
    order_min: u8,
    order_max: u8,
    state: Mutex<BankState>,
}

impl Bank {
    pub(crate) fn new(id: usize, info: BankInfo) -> Self {
        let order_max = info.maximum_order.max(MIN_ORDER);
        Self {
            id,
            order_min: MIN_ORDER,
            order_max,
            state: Mutex::new(BankState::new(MIN_ORDER, order_max)),
            info,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn rights(&self) -> MemRights {
        self.info.capabilities
    }

    pub fn order_min(&self) -> u8 {
        self.order_min
    }

    pub fn order_max(&self) -> u8 {
        self.order_max
    }

    pub fn size_total(&self) -> u64 {
        self.info.size
    }

    pub fn info(&self) -> &BankInfo {
        &self.info
    }

    /// True if this bank may serve a request of `order` needing `rights`.
    pub fn accepts(&self, order: u8, rights: MemRights) -> bool {
        order <= self.order_max && self.info.capabilities.satisfies(rights)
    }

    /// Allocate `size` padded bytes at `alignment`.
    pub(crate) fn allocate(
        &self,
        system: u64,
        size: u32,
        requested: u32,
        alignment: u32,
        rights: MemRights,
        pool: &DescriptorPool,
        backend: &dyn MemBackend,
    ) -> Result<MemHandle, MemError> {
        let order = order_of(size);
        let mut st = self.state.lock();
        let found = st.find_free(size, alignment, order);
        let (idx, fresh) = match found {
            Some(idx) => {
                st.unlink_free(idx);
                (idx, false)
            }
            None => {
                drop(st);
                let descriptor = self.fresh_block(size, alignment, pool, backend)?;
                st = self.state.lock();
                (st.link(descriptor), true)
            }
        };

        if let Err((err, survivor)) = st.split(idx, size, alignment, pool, backend) {
            if fresh {
                let released = st.detach(survivor);
                drop(st);
                if let Some(d) = released {
                    backend.release_memory(&d);
                    pool.release(d);
                }
            } else {
                st.push_free(survivor);
            }
            return Err(err);
        }

        let d = &mut st.blocks[idx];
        d.allocated = true;
        d.alignment = alignment;
        d.rights = rights;
        d.requested = requested;
        let block_size = d.size;
        let handle = MemHandle::new(system, self.id, idx, d);
        st.size_allocated += u64::from(block_size);
        st.bytes_requested += u64::from(requested);
        st.note_peak();
        debug_assert!(st.size_allocated <= self.info.size);
        Ok(handle)
    }

    fn fresh_block(
        &self,
        size: u32,
        alignment: u32,
        pool: &DescriptorPool,
        backend: &dyn MemBackend,
    ) -> Result<Box<BlockDescriptor>, MemError> {
        let minimum = size
            .checked_add(alignment - 1)
            .and_then(|s| s.checked_add(GRANULE - 1))
            .map(|s| s & !(GRANULE - 1))
            .ok_or_else(|| MemError::FunctionFailed(format!("request of {size} bytes is too large")))?;
        let mut descriptor = pool.get().ok_or(MemError::OutOfMemory)?;
        if let Err(err) = backend.get_memory(&self.info, minimum, &mut descriptor) {
            pool.release(descriptor);
            return Err(err.into());
        }
        descriptor.size_changed(self.order_max);
        Ok(descriptor)
    }

    /// Return an allocated block, merging it with free neighbours and either
    /// keeping it for reuse or releasing it to the device.
    pub(crate) fn free(
        &self,
        idx: Index,
        pool: &DescriptorPool,
        backend: &dyn MemBackend,
    ) -> Result<(), MemError> {
        let mut st = self.state.lock();
        let Some(d) = st.blocks.get_mut(idx) else {
            return Err(violation(format!("bank {} does not own the freed block", self.id)));
        };
        if !d.allocated {
            return Err(violation(format!("double free of block at {:#x}", d.start)));
        }
        d.allocated = false;
        d.alignment = 0;
        d.rights = MemRights::NONE;
        let size = u64::from(d.size);
        let requested = u64::from(std::mem::take(&mut d.requested));
        st.size_allocated -= size;
        st.bytes_requested -= requested;

        let mut cur = idx;
        if let Some(prev) = st.free_neighbor_before(cur) {
            st.unlink_free(prev);
            match st.merge(prev, cur, pool, backend) {
                Ok(()) => cur = prev,
                Err(err) => {
                    debug!(bank = self.id, error = %err, "merge with previous block failed");
                    st.push_free(prev);
                }
            }
        }
        if let Some(next) = st.free_neighbor_after(cur) {
            st.unlink_free(next);
            if let Err(err) = st.merge(cur, next, pool, backend) {
                debug!(bank = self.id, error = %err, "merge with next block failed");
                st.push_free(next);
            }
        }

        let keep = st.size_allocated + st.free_list_size < st.holdback_size
            || !backend.is_full_block(&st.blocks[cur]);
        if keep {
            st.push_free(cur);
            return Ok(());
        }
        let released = st.detach(cur);
        drop(st);
        if let Some(d) = released {
            backend.release_memory(&d);
            pool.release(d);
        }
        Ok(())
    }

    /// Close the current accounting period and recompute the holdback size.
    pub(crate) fn new_period(&self, margin_cap: u64) {
        let mut st = self.state.lock();
        let peak = st.past_size_allocated.iter().copied().max().unwrap_or(0);
        st.holdback_size = peak + (peak >> 3).min(margin_cap);
        st.period = (st.period + 1) % HISTORY_PERIODS;
        let period = st.period;
        st.past_size_allocated[period] = 0;
    }

    /// Release every free-listed block to the device. Returns bytes released.
    pub(crate) fn free_unused(&self, pool: &DescriptorPool, backend: &dyn MemBackend) -> u64 {
        let evicted: Vec<Box<BlockDescriptor>> = {
            let mut st = self.state.lock();
            let free: Vec<Index> = st
                .all_memory
                .values()
                .copied()
                .filter(|&idx| st.blocks[idx].free_slot.is_some())
                .collect();
            free.into_iter().filter_map(|idx| st.detach(idx)).collect()
        };
        let mut released = 0;
        for d in evicted {
            released += u64::from(d.size);
            backend.release_memory(&d);
            pool.release(d);
        }
        released
    }

    /// Force-release every block. Returns the number of leaked allocations.
    pub(crate) fn destroy(&self, pool: &DescriptorPool, backend: &dyn MemBackend) -> usize {
        let (leaked, blocks) = {
            let mut st = self.state.lock();
            let mut leaked = 0;
            for d in st.blocks.iter().map(|(_, d)| d).filter(|d| d.allocated) {
                warn!(bank = self.id, start = d.start, size = d.size, "leaked allocation at close");
                leaked += 1;
            }
            let blocks: Vec<_> = st.blocks.drain().map(|(_, d)| d).collect();
            *st = BankState::new(self.order_min, self.order_max);
            (leaked, blocks)
        };
        for d in blocks {
            backend.release_memory(&d);
            pool.release(d);
        }
        leaked
    }

    pub fn stats(&self) -> BankStats {
        let st = self.state.lock();
        BankStats {
            bank: self.id,
            rights: self.info.capabilities,
            order_min: self.order_min,
            order_max: self.order_max,
            size_total: self.info.size,
            size_allocated: st.size_allocated,
            bytes_requested: st.bytes_requested,
            free_list_size: st.free_list_size,
            holdback_size: st.holdback_size,
            blocks: st.blocks.len(),
            free_blocks: st.blocks.iter().filter(|(_, d)| d.free_slot.is_some()).count(),
        }
    }

    /// Address-ordered snapshot of every block.
    pub fn layout(&self) -> Vec<BlockInfo> {
        let st = self.state.lock();
        st.all_memory
            .values()
            .map(|&idx| {
                let d = &st.blocks[idx];
                BlockInfo { start: d.start, size: d.size, allocated: d.allocated }
            })
            .collect()
    }

    /// Recompute every accounting total and check the block partition.
    pub fn validate(&self) -> Result<(), MemError> {
        let st = self.state.lock();
        let fail = |msg: String| Err(MemError::InvariantViolation(format!("bank {}: {msg}", self.id)));

        if st.all_memory.len() != st.blocks.len() {
            return fail(format!(
                "{} blocks indexed by address, {} stored",
                st.all_memory.len(),
                st.blocks.len()
            ));
        }

        let mut allocated = 0u64;
        let mut off_list = 0usize;
        let mut prev_end = 0u64;
        for (&start, &idx) in &st.all_memory {
            let Some(d) = st.blocks.get(idx) else {
                return fail(format!("dangling index at {start:#x}"));
            };
            if d.start != start {
                return fail(format!("block at {:#x} indexed under {start:#x}", d.start));
            }
            if d.size == 0 || d.start < prev_end {
                return fail(format!("block at {start:#x} overlaps its predecessor"));
            }
            if d.order != order_of(d.size) {
                return fail(format!("stale order on block at {start:#x}"));
            }
            prev_end = d.end();
            if d.allocated {
                allocated += u64::from(d.size);
                if d.free_slot.is_some() {
                    return fail(format!("allocated block at {start:#x} is on a free list"));
                }
            } else if d.free_slot.is_none() {
                off_list += 1;
            }
        }
        if off_list > 0 {
            return fail(format!("{off_list} free blocks missing from the free lists"));
        }
        if allocated != st.size_allocated {
            return fail(format!("size_allocated {} but blocks sum to {allocated}", st.size_allocated));
        }

        let mut listed = 0u64;
        for (tier, lists) in [(FreeTier::Exact, &st.exact), (FreeTier::Bigger, &st.bigger)] {
            for (index, list) in lists.iter().enumerate() {
                let mut prev = None;
                let mut cur = list.head;
                while let Some(idx) = cur {
                    let d = &st.blocks[idx];
                    if d.free_slot != Some(FreeSlot { tier, index }) || d.free_prev != prev {
                        return fail(format!("broken free list link at {:#x}", d.start));
                    }
                    if st.slot_for(d) != (FreeSlot { tier, index }) {
                        return fail(format!("block at {:#x} on the wrong free list", d.start));
                    }
                    listed += u64::from(d.size);
                    prev = cur;
                    cur = d.free_next;
                }
                if list.tail != prev {
                    return fail(format!("free list tail mismatch ({tier:?} {index})"));
                }
            }
        }
        if listed != st.free_list_size {
            return fail(format!("free_list_size {} but lists sum to {listed}", st.free_list_size));
        }
        Ok(())
    }

    /// Dump the block map at debug level.
    pub fn log_usage_map(&self) {
        let st = self.state.lock();
        debug!(
            bank = self.id,
            rights = %self.info.capabilities,
            allocated = st.size_allocated,
            free = st.free_list_size,
            holdback = st.holdback_size,
            "bank usage"
        );
        for &idx in st.all_memory.values() {
            let d = &st.blocks[idx];
            debug!(
                bank = self.id,
                start = d.start,
                size = d.size,
                allocated = d.allocated,
                region = d.region.0,
                "block"
            );
        }
    }
}

#[cfg(test)]
#[path = "bank_tests.rs"]
mod tests;
