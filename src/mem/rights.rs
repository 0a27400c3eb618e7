// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! Capability rights of banks and allocations.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::Serialize;

/// Bitmask of access capabilities a bank offers or a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct MemRights(u32);

impl MemRights {
    pub const NONE: Self = Self(0);
    pub const PP_READ: Self = Self(1 << 0);
    pub const PP_WRITE: Self = Self(1 << 1);
    pub const GP_READ: Self = Self(1 << 2);
    pub const GP_WRITE: Self = Self(1 << 3);
    pub const CPU_READ: Self = Self(1 << 4);
    pub const CPU_WRITE: Self = Self(1 << 5);
    /// GP allocates L2 cache lines on read. A hint, never matched against banks.
    pub const GP_L2_ALLOC: Self = Self(1 << 6);

    /// Bits that take part in bank matching.
    const CAPABILITY_MASK: u32 = 0xFF & !Self::GP_L2_ALLOC.0;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if a bank with `self` rights can serve a request for `requested`.
    pub const fn satisfies(self, requested: Self) -> bool {
        let needed = requested.0 & Self::CAPABILITY_MASK;
        self.0 & needed == needed
    }
}

impl BitOr for MemRights {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MemRights {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for MemRights {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for MemRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superset_satisfies_subset() {
        let bank = MemRights::GP_READ | MemRights::GP_WRITE | MemRights::PP_READ;
        assert!(bank.satisfies(MemRights::GP_WRITE | MemRights::PP_READ));
        assert!(!bank.satisfies(MemRights::CPU_WRITE));
    }

    #[test]
    fn l2_hint_is_ignored_for_matching() {
        let bank = MemRights::GP_READ;
        assert!(bank.satisfies(MemRights::GP_READ | MemRights::GP_L2_ALLOC));
    }
}
