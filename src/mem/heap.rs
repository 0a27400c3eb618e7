// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! Growable heaps built from a chain of bank allocations.

use std::sync::Arc;

use tracing::{debug, warn};

use super::block::MemHandle;
use super::error::{violation, MemError};
use super::rights::MemRights;
use super::system::MemorySystem;
use crate::ContextTag;

/// A logically contiguous allocation that grows one block at a time.
///
/// The first block is allocated up front; later blocks are appended by
/// [`grow_on_demand`](Heap::grow_on_demand) when the consumer runs out of room.
pub struct Heap {
    system: Arc<MemorySystem>,
    ctx: ContextTag,
    blocks: Vec<MemHandle>,
    block_size: u32,
    maximum_size: u32,
    size: u32,
    current: u64,
}

impl Heap {
    pub const RIGHTS: MemRights = MemRights::from_bits(MemRights::GP_WRITE.bits() | MemRights::PP_READ.bits());

    pub fn new(
        system: Arc<MemorySystem>,
        ctx: ContextTag,
        default_size: u32,
        maximum_size: u32,
        block_size: u32,
    ) -> Result<Self, MemError> {
        let first = Self::alloc_block(&system, ctx, default_size)?;
        let current = first.addr();
        let size = first.size();
        Ok(Self {
            system,
            ctx,
            blocks: vec![first],
            block_size,
            maximum_size,
            size,
            current,
        })
    }

    fn alloc_block(system: &MemorySystem, ctx: ContextTag, size: u32) -> Result<MemHandle, MemError> {
        system.alloc(ctx, size, system.config().heap_alignment, Self::RIGHTS)
    }

    fn first(&self) -> &MemHandle {
        &self.blocks[0]
    }

    fn last(&self) -> &MemHandle {
        &self.blocks[self.blocks.len() - 1]
    }

    /// Append one `block_size` block. Returns the new segment's
    /// `(start, end)` addresses and moves the cursor to its start.
    pub fn grow_on_demand(&mut self) -> Result<(u64, u64), MemError> {
        if u64::from(self.size) + u64::from(self.block_size) > u64::from(self.maximum_size) {
            return Err(MemError::OutOfMemory);
        }
        let mem = Self::alloc_block(&self.system, self.ctx, self.block_size)?;
        let (start, end) = (mem.addr(), mem.end());
        self.size += mem.size();
        self.blocks.push(mem);
        self.current = start;
        debug!(start, end, size = self.size, "extended heap");
        Ok((start, end))
    }

    /// Free every block but the first and move the cursor back to the start.
    pub fn reset(&mut self) {
        for mem in self.blocks.drain(1..) {
            if let Err(err) = self.system.free(mem) {
                warn!(error = %err, "failed to free heap block on reset");
            }
        }
        self.size = self.blocks[0].size();
        self.current = self.blocks[0].addr();
    }

    /// Replace the whole chain with a single block of `new_size` bytes.
    pub fn resize(&mut self, new_size: u32) -> Result<(), MemError> {
        if new_size > self.maximum_size {
            return Err(violation(format!(
                "heap resize to {new_size} exceeds maximum {}",
                self.maximum_size
            )));
        }
        let first = Self::alloc_block(&self.system, self.ctx, new_size)?;
        for mem in std::mem::replace(&mut self.blocks, vec![first]) {
            if let Err(err) = self.system.free(mem) {
                warn!(error = %err, "failed to free heap block on resize");
            }
        }
        self.size = self.blocks[0].size();
        self.current = self.blocks[0].addr();
        debug!(size = self.size, "resized heap");
        Ok(())
    }

    /// Bytes the consumer has used, derived from the cursor position.
    pub fn used_bytes(&self) -> u32 {
        let last = self.last();
        if (last.addr()..=last.end()).contains(&self.current) {
            self.size - (last.end() - self.current) as u32
        } else {
            self.size
        }
    }

    /// Record how far the consumer has written.
    pub fn set_current_address(&mut self, addr: u64) {
        self.current = addr;
    }

    pub fn current_address(&self) -> u64 {
        self.current
    }

    /// Block holding heap offset `offset` and the offset within it.
    pub fn find_block_with_offset(&self, offset: u32) -> Option<(&MemHandle, u32)> {
        let mut offset = offset;
        for mem in &self.blocks {
            if offset < mem.size() {
                return Some((mem, offset));
            }
            offset -= mem.size();
        }
        None
    }

    /// GPU address of heap offset `offset`.
    pub fn addr(&self, offset: u32) -> Option<u64> {
        self.find_block_with_offset(offset)
            .and_then(|(mem, within)| mem.addr_at(within))
    }

    pub fn start_address(&self) -> u64 {
        self.first().addr()
    }

    pub fn end_address(&self) -> u64 {
        self.last().end()
    }

    pub fn end_address_of_first_block(&self) -> u64 {
        self.first().end()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn maximum_size(&self) -> u32 {
        self.maximum_size
    }

    /// Bytes currently allocated to the heap.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for mem in self.blocks.drain(..) {
            if let Err(err) = self.system.free(mem) {
                warn!(error = %err, "failed to free heap block");
            }
        }
    }
}
