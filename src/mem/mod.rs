// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! Bank memory allocator.
//!
//! GPU-addressable memory comes from one or more banks, each with its own
//! capability rights. Blocks are carved from device regions, split to size on
//! allocation and merged with free neighbours on release. A per-bank holdback
//! tracker decides how much freed memory stays cached instead of going back to
//! the device.

mod backend;
pub(crate) mod bank;
mod block;
mod descriptor;
mod error;
mod heap;
pub(crate) mod order;
mod rights;
mod system;

pub use backend::{BankInfo, MemBackend, MockBackend};
pub use bank::{Bank, BankStats, BlockInfo, HISTORY_PERIODS};
pub use block::{resize_pair, BlockDescriptor, MemHandle, MemList, RegionId};
pub use descriptor::DescriptorPool;
pub use error::{BackendError, MemError};
pub use heap::Heap;
pub use order::{order_of, pad_size, GRANULE, MIN_ORDER};
pub use rights::MemRights;
pub use system::{MemStats, MemorySystem};
