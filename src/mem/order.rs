// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! Size class helpers.

/// Smallest order any bank supports (64 bytes).
pub const MIN_ORDER: u8 = 6;

/// Allocation granule; every size and alignment is a multiple of it.
pub const GRANULE: u32 = 1 << MIN_ORDER;

/// Pad `size` up to the next granule multiple.
pub fn pad_size(size: u32) -> u32 {
    size.saturating_add(GRANULE - 1) & !(GRANULE - 1)
}

/// `ceil(log2(size))`, clamped to [`MIN_ORDER`].
pub fn order_of(size: u32) -> u8 {
    let order = if size <= 1 {
        0
    } else {
        (u32::BITS - (size - 1).leading_zeros()) as u8
    };
    order.max(MIN_ORDER)
}

/// Clamp an alignment to the granule and round it to a power of two.
pub fn normalize_alignment(alignment: u32) -> u32 {
    alignment.max(GRANULE).checked_next_power_of_two().unwrap_or(1 << 31)
}

/// Bytes needed to move `addr` forward to the next `alignment` boundary.
pub fn alignment_correction(addr: u64, alignment: u32) -> u64 {
    let align = u64::from(alignment);
    ((addr + align - 1) & !(align - 1)) - addr
}
