// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! Device backend abstraction and a host-side mock used for tests and
//! CPU-only runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::block::{resize_pair, BlockDescriptor, RegionId};
use super::error::BackendError;
use super::order::pad_size;
use super::rights::MemRights;

/// One capability set reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankInfo {
    pub capabilities: MemRights,
    /// Total bytes the device can provide for this bank.
    pub size: u64,
    pub maximum_order: u8,
    /// Backend identifier passed back on every memory request.
    pub cache_settings: u32,
}

/// Trait abstracting the device memory provider behind the bank allocator.
///
/// Every method may be called with a bank lock held except
/// [`get_memory`](MemBackend::get_memory), which the allocator calls unlocked.
pub trait MemBackend: Send + Sync {
    fn open(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn close(&self) {}

    fn num_capability_sets(&self) -> usize;

    fn capability_sets(&self) -> Result<Vec<BankInfo>, BackendError>;

    fn init_bank(&self, _info: &BankInfo) -> Result<(), BackendError> {
        Ok(())
    }

    /// Fresh descriptor storage; `None` means host memory is exhausted.
    fn allocate_descriptor(&self) -> Option<Box<BlockDescriptor>> {
        Some(Box::default())
    }

    fn free_descriptor(&self, _descriptor: Box<BlockDescriptor>) {}

    /// Bind at least `minimum_size` bytes of device memory to `descriptor`.
    fn get_memory(
        &self,
        bank: &BankInfo,
        minimum_size: u32,
        descriptor: &mut BlockDescriptor,
    ) -> Result<(), BackendError>;

    /// Return the range covered by `descriptor` to the device.
    fn release_memory(&self, descriptor: &BlockDescriptor);

    fn resize_blocks(
        &self,
        a: &mut BlockDescriptor,
        b: &mut BlockDescriptor,
        size_change: i64,
    ) -> Result<(), BackendError> {
        resize_pair(a, b, size_change)
    }

    /// True if `descriptor` covers a whole device region and can be released.
    fn is_full_block(&self, descriptor: &BlockDescriptor) -> bool;
}

// -- Mock backend (testing + CPU fallback) ------------------------------------

struct MockRegion {
    start: u64,
    size: u32,
    live: u32,
    cache_settings: u32,
}

#[derive(Default)]
struct MockState {
    regions: HashMap<RegionId, MockRegion>,
    /// Per bank: free address ranges, start -> length.
    spaces: HashMap<u32, BTreeMap<u64, u64>>,
    descriptors_outstanding: usize,
    descriptor_budget: Option<usize>,
    fail_get_memory: usize,
    fail_resize_in: Option<usize>,
    released_bytes: u64,
    host_oom_on_get_memory: bool,
}

/// Mock device backed by plain address bookkeeping.
pub struct MockBackend {
    banks: Vec<BankInfo>,
    next_region: AtomicU64,
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Banks are told apart by `cache_settings`, which must be unique.
    pub fn new(banks: Vec<BankInfo>) -> Self {
        let mut state = MockState::default();
        for (i, bank) in banks.iter().enumerate() {
            let base = Self::bank_base(i);
            let mut free = BTreeMap::new();
            free.insert(base, bank.size);
            state.spaces.insert(bank.cache_settings, free);
        }
        Self { banks, next_region: AtomicU64::new(1), state: Mutex::new(state) }
    }

    /// Single bank with all GPU and CPU rights.
    pub fn single_bank(size: u64, maximum_order: u8) -> Self {
        Self::new(vec![BankInfo {
            capabilities: MemRights::from_bits(0x3F),
            size,
            maximum_order,
            cache_settings: 0,
        }])
    }

    /// Device addresses of bank `i` start here.
    pub fn bank_base(i: usize) -> u64 {
        (i as u64 + 1) << 32
    }

    /// Limit how many descriptors may be live at once.
    pub fn set_descriptor_budget(&self, budget: Option<usize>) {
        self.state.lock().descriptor_budget = budget;
    }

    /// Fail the next `count` device memory requests.
    pub fn fail_next_get_memory(&self, count: usize) {
        self.state.lock().fail_get_memory = count;
    }

    /// Report host exhaustion from `get_memory` until cleared.
    pub fn set_host_oom_on_get_memory(&self, enabled: bool) {
        self.state.lock().host_oom_on_get_memory = enabled;
    }

    /// Fail the resize issued `calls` resizes from now (0 = the next one).
    pub fn fail_resize_in(&self, calls: usize) {
        self.state.lock().fail_resize_in = Some(calls);
    }

    /// Device regions with at least one byte still held.
    pub fn live_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Bytes of device regions still held by the allocator.
    pub fn device_bytes_in_use(&self) -> u64 {
        self.state.lock().regions.values().map(|r| u64::from(r.size)).sum()
    }

    /// Total bytes returned through `release_memory`.
    pub fn released_bytes(&self) -> u64 {
        self.state.lock().released_bytes
    }

    pub fn descriptors_outstanding(&self) -> usize {
        self.state.lock().descriptors_outstanding
    }

    fn give_back_range(space: &mut BTreeMap<u64, u64>, start: u64, len: u64) {
        let mut start = start;
        let mut len = len;
        if let Some((&next_start, &next_len)) = space.range(start..).next() {
            if start + len == next_start {
                space.remove(&next_start);
                len += next_len;
            }
        }
        if let Some((&prev_start, &prev_len)) = space.range(..start).next_back() {
            if prev_start + prev_len == start {
                space.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        space.insert(start, len);
    }
}

impl MemBackend for MockBackend {
    fn num_capability_sets(&self) -> usize {
        self.banks.len()
    }

    fn capability_sets(&self) -> Result<Vec<BankInfo>, BackendError> {
        Ok(self.banks.clone())
    }

    fn allocate_descriptor(&self) -> Option<Box<BlockDescriptor>> {
        let mut s = self.state.lock();
        if let Some(budget) = s.descriptor_budget {
            if s.descriptors_outstanding >= budget {
                return None;
            }
        }
        s.descriptors_outstanding += 1;
        Some(Box::default())
    }

    fn free_descriptor(&self, _descriptor: Box<BlockDescriptor>) {
        let mut s = self.state.lock();
        s.descriptors_outstanding = s.descriptors_outstanding.saturating_sub(1);
    }

    fn get_memory(
        &self,
        bank: &BankInfo,
        minimum_size: u32,
        descriptor: &mut BlockDescriptor,
    ) -> Result<(), BackendError> {
        let mut s = self.state.lock();
        if s.host_oom_on_get_memory {
            return Err(BackendError::OutOfHostMemory);
        }
        if s.fail_get_memory > 0 {
            s.fail_get_memory -= 1;
            return Err(BackendError::DeviceExhausted { requested: minimum_size.into(), available: 0 });
        }

        let size = pad_size(minimum_size);
        let space = s
            .spaces
            .get_mut(&bank.cache_settings)
            .ok_or_else(|| BackendError::Unsupported(format!("unknown bank {}", bank.cache_settings)))?;
        let found = space
            .iter()
            .find(|&(_, &len)| len >= u64::from(size))
            .map(|(&start, &len)| (start, len));
        let Some((start, len)) = found else {
            let available = space.values().copied().max().unwrap_or(0);
            return Err(BackendError::DeviceExhausted { requested: size.into(), available });
        };
        space.remove(&start);
        if len > u64::from(size) {
            space.insert(start + u64::from(size), len - u64::from(size));
        }

        let region = RegionId(self.next_region.fetch_add(1, Ordering::Relaxed));
        s.regions.insert(
            region,
            MockRegion { start, size, live: size, cache_settings: bank.cache_settings },
        );
        descriptor.start = start;
        descriptor.size = size;
        descriptor.region = region;
        Ok(())
    }

    fn release_memory(&self, descriptor: &BlockDescriptor) {
        let mut s = self.state.lock();
        s.released_bytes += u64::from(descriptor.size);
        let done = match s.regions.get_mut(&descriptor.region) {
            Some(region) => {
                region.live = region.live.saturating_sub(descriptor.size);
                region.live == 0
            }
            None => {
                tracing::warn!(region = descriptor.region.0, "release of unknown device region");
                false
            }
        };
        if done {
            if let Some(region) = s.regions.remove(&descriptor.region) {
                if let Some(space) = s.spaces.get_mut(&region.cache_settings) {
                    Self::give_back_range(space, region.start, region.size.into());
                }
            }
        }
    }

    fn resize_blocks(
        &self,
        a: &mut BlockDescriptor,
        b: &mut BlockDescriptor,
        size_change: i64,
    ) -> Result<(), BackendError> {
        {
            let mut s = self.state.lock();
            match s.fail_resize_in {
                Some(0) => {
                    s.fail_resize_in = None;
                    return Err(BackendError::Unsupported("injected resize failure".into()));
                }
                Some(n) => s.fail_resize_in = Some(n - 1),
                None => {}
            }
        }
        resize_pair(a, b, size_change)
    }

    fn is_full_block(&self, descriptor: &BlockDescriptor) -> bool {
        self.state
            .lock()
            .regions
            .get(&descriptor.region)
            .map(|r| r.start == descriptor.start && r.size == descriptor.size)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_memory_pads_and_binds_region() {
        let backend = MockBackend::single_bank(1 << 20, 20);
        let info = backend.capability_sets().unwrap().remove(0);
        let mut d = BlockDescriptor::default();
        backend.get_memory(&info, 100, &mut d).unwrap();
        assert_eq!(d.size, 128);
        assert_eq!(d.start, MockBackend::bank_base(0));
        assert!(d.region.is_bound());
        assert!(backend.is_full_block(&d));
    }

    #[test]
    fn exhausted_bank_reports_device_exhaustion() {
        let backend = MockBackend::single_bank(4096, 20);
        let info = backend.capability_sets().unwrap().remove(0);
        let mut a = BlockDescriptor::default();
        backend.get_memory(&info, 4096, &mut a).unwrap();
        let mut b = BlockDescriptor::default();
        let result = backend.get_memory(&info, 64, &mut b);
        assert!(matches!(result, Err(BackendError::DeviceExhausted { .. })));
    }

    #[test]
    fn release_returns_address_range() {
        let backend = MockBackend::single_bank(4096, 20);
        let info = backend.capability_sets().unwrap().remove(0);
        let mut a = BlockDescriptor::default();
        backend.get_memory(&info, 4096, &mut a).unwrap();
        backend.release_memory(&a);
        assert_eq!(backend.live_regions(), 0);
        assert_eq!(backend.released_bytes(), 4096);
        let mut b = BlockDescriptor::default();
        backend.get_memory(&info, 4096, &mut b).unwrap();
        assert_eq!(b.start, a.start);
    }

    #[test]
    fn region_survives_partial_release() {
        let backend = MockBackend::single_bank(4096, 20);
        let info = backend.capability_sets().unwrap().remove(0);
        let mut whole = BlockDescriptor::default();
        backend.get_memory(&info, 256, &mut whole).unwrap();
        let mut tail = BlockDescriptor::default();
        backend.resize_blocks(&mut whole, &mut tail, -64).unwrap();
        backend.release_memory(&tail);
        assert_eq!(backend.live_regions(), 1);
        assert!(!backend.is_full_block(&whole));
        backend.release_memory(&whole);
        assert_eq!(backend.live_regions(), 0);
    }

    #[test]
    fn descriptor_budget_is_enforced() {
        let backend = MockBackend::single_bank(4096, 20);
        backend.set_descriptor_budget(Some(1));
        let d = backend.allocate_descriptor().unwrap();
        assert!(backend.allocate_descriptor().is_none());
        backend.free_descriptor(d);
        assert!(backend.allocate_descriptor().is_some());
    }
}
