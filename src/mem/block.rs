// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! Block metadata and the caller-facing allocation handle.

use generational_arena::Index;

use super::error::BackendError;
use super::order::order_of;
use super::rights::MemRights;

/// Identifies the device allocation a block was carved from.
/// `RegionId(0)` marks a blank descriptor not yet bound to device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegionId(pub u64);

impl RegionId {
    pub const UNBOUND: Self = Self(0);

    pub fn is_bound(self) -> bool {
        self.0 != 0
    }
}

/// Which free list tier a block sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeTier {
    Exact,
    Bigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeSlot {
    pub tier: FreeTier,
    pub index: usize,
}

/// Metadata for one contiguous range of bank memory.
///
/// Descriptors are recycled through the [`DescriptorPool`](super::DescriptorPool);
/// backends fill in `start`, `size` and `region` when they hand out memory.
#[derive(Debug, Default)]
pub struct BlockDescriptor {
    pub start: u64,
    pub size: u32,
    pub region: RegionId,
    pub(crate) alignment: u32,
    pub(crate) order: u8,
    pub(crate) is_pow2: bool,
    pub(crate) allocated: bool,
    /// Bytes the caller asked for, before padding.
    pub(crate) requested: u32,
    pub(crate) rights: MemRights,
    pub(crate) free_slot: Option<FreeSlot>,
    pub(crate) free_prev: Option<Index>,
    pub(crate) free_next: Option<Index>,
}

impl BlockDescriptor {
    /// Reset every field so the descriptor can be reused.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn end(&self) -> u64 {
        self.start + u64::from(self.size)
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Recompute order and the pow2 flag after `size` changed.
    pub(crate) fn size_changed(&mut self, order_max: u8) {
        self.order = order_of(self.size);
        self.is_pow2 = (1u64 << self.order) == u64::from(self.size) && self.order <= order_max;
    }
}

/// Move the boundary between two blocks of the same region.
///
/// A positive `size_change` moves bytes from the front of `b` to the end of
/// `a`; a negative one moves bytes from the end of `a` to the front of `b`.
/// A blank descriptor (size 0) binds to its partner's region first.
pub fn resize_pair(
    a: &mut BlockDescriptor,
    b: &mut BlockDescriptor,
    size_change: i64,
) -> Result<(), BackendError> {
    if size_change == 0 {
        return Ok(());
    }
    if a.region.is_bound() && b.region.is_bound() && a.region != b.region {
        return Err(BackendError::RegionMismatch);
    }

    if a.size == 0 {
        a.region = b.region;
        a.start = b.start;
    } else if b.size == 0 {
        b.region = a.region;
        b.start = a.end();
    } else if a.end() != b.start {
        return Err(BackendError::NotAdjacent);
    }

    let moved = u32::try_from(size_change.unsigned_abs())
        .map_err(|_| BackendError::Unsupported("resize larger than 4 GiB".into()))?;
    if size_change > 0 {
        if b.size < moved {
            return Err(BackendError::Unsupported("resize beyond block end".into()));
        }
        a.size += moved;
        b.size -= moved;
        b.start += u64::from(moved);
    } else {
        if a.size < moved {
            return Err(BackendError::Unsupported("resize beyond block start".into()));
        }
        a.size -= moved;
        b.size += moved;
        b.start -= u64::from(moved);
    }
    Ok(())
}

/// Exclusive handle to an allocated block.
///
/// The caller owns the memory until it passes the handle back to
/// [`MemorySystem::free`](super::MemorySystem::free).
#[derive(Debug)]
#[must_use = "bank memory stays allocated until the handle is freed"]
pub struct MemHandle {
    pub(crate) system: u64,
    pub(crate) bank: usize,
    pub(crate) index: Index,
    start: u64,
    size: u32,
    requested: u32,
    order: u8,
    alignment: u32,
    rights: MemRights,
}

impl MemHandle {
    pub(crate) fn new(system: u64, bank: usize, index: Index, desc: &BlockDescriptor) -> Self {
        Self {
            system,
            bank,
            index,
            start: desc.start,
            size: desc.size,
            requested: desc.requested,
            order: desc.order,
            alignment: desc.alignment,
            rights: desc.rights,
        }
    }

    /// GPU address of the first byte.
    pub fn addr(&self) -> u64 {
        self.start
    }

    /// GPU address at `offset`; `None` past the end of the block.
    pub fn addr_at(&self, offset: u32) -> Option<u64> {
        (offset <= self.size).then(|| self.start + u64::from(offset))
    }

    pub fn end(&self) -> u64 {
        self.start + u64::from(self.size)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Size the caller asked for, before granule padding.
    pub fn requested_size(&self) -> u32 {
        self.requested
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Rights requested when the block was allocated.
    pub fn rights(&self) -> MemRights {
        self.rights
    }

    /// Registration index of the owning bank.
    pub fn bank(&self) -> usize {
        self.bank
    }
}

/// Ordered list of allocations freed together, e.g. a job's cleanup list.
#[derive(Debug, Default)]
pub struct MemList {
    items: Vec<MemHandle>,
}

impl MemList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mem: MemHandle) {
        self.items.push(mem);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of the block sizes on the list.
    pub fn total_size(&self) -> u64 {
        self.items.iter().map(|m| u64::from(m.size())).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemHandle> {
        self.items.iter()
    }
}

impl IntoIterator for MemList {
    type Item = MemHandle;
    type IntoIter = std::vec::IntoIter<MemHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl FromIterator<MemHandle> for MemList {
    fn from_iter<I: IntoIterator<Item = MemHandle>>(iter: I) -> Self {
        Self { items: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(start: u64, size: u32, region: u64) -> BlockDescriptor {
        BlockDescriptor { start, size, region: RegionId(region), ..Default::default() }
    }

    #[test]
    fn split_off_tail_into_blank() {
        let mut a = bound(0x1000, 256, 1);
        let mut b = BlockDescriptor::default();
        resize_pair(&mut a, &mut b, -64).unwrap();
        assert_eq!((a.start, a.size), (0x1000, 192));
        assert_eq!((b.start, b.size, b.region), (0x10c0, 64, RegionId(1)));
    }

    #[test]
    fn split_off_head_into_blank() {
        let mut a = BlockDescriptor::default();
        let mut b = bound(0x1000, 256, 1);
        resize_pair(&mut a, &mut b, 128).unwrap();
        assert_eq!((a.start, a.size), (0x1000, 128));
        assert_eq!((b.start, b.size), (0x1080, 128));
    }

    #[test]
    fn merge_moves_everything_into_head() {
        let mut a = bound(0x1000, 128, 3);
        let mut b = bound(0x1080, 64, 3);
        resize_pair(&mut a, &mut b, 64).unwrap();
        assert_eq!(a.size, 192);
        assert_eq!(b.size, 0);
    }

    #[test]
    fn cross_region_resize_is_rejected() {
        let mut a = bound(0x1000, 128, 1);
        let mut b = bound(0x1080, 64, 2);
        assert_eq!(resize_pair(&mut a, &mut b, 64), Err(BackendError::RegionMismatch));
    }

    #[test]
    fn gap_between_blocks_is_rejected() {
        let mut a = bound(0x1000, 64, 1);
        let mut b = bound(0x1080, 64, 1);
        assert_eq!(resize_pair(&mut a, &mut b, 64), Err(BackendError::NotAdjacent));
    }

    #[test]
    fn pow2_flag_respects_order_max() {
        let mut d = bound(0, 4096, 1);
        d.size_changed(20);
        assert!(d.is_pow2);
        assert_eq!(d.order, 12);
        d.size_changed(11);
        assert!(!d.is_pow2);
        d.size = 4160;
        d.size_changed(20);
        assert!(!d.is_pow2);
        assert_eq!(d.order, 13);
    }
}
