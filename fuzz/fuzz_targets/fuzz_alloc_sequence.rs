//! Fuzz target for allocator operation sequences.
//!
//! Arbitrary alloc/free/period sequences must keep every bank consistent and
//! must never hand out overlapping blocks.

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use gpu_base::mem::{BankInfo, MemHandle, MemRights, MemorySystem, MockBackend};
use gpu_base::{ContextTag, MemConfig};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Alloc { size: u16, align_shift: u8, rights: u8 },
    Free { index: u8 },
    NewPeriod,
    FreeUnused,
}

fuzz_target!(|ops: Vec<Op>| {
    let backend = Arc::new(MockBackend::new(vec![
        BankInfo {
            capabilities: MemRights::from_bits(0x3F),
            size: 1 << 22,
            maximum_order: 18,
            cache_settings: 0,
        },
        BankInfo {
            capabilities: MemRights::GP_READ | MemRights::GP_WRITE,
            size: 1 << 20,
            maximum_order: 14,
            cache_settings: 1,
        },
    ]));
    let Ok(system) = MemorySystem::open(backend.clone(), MemConfig::default()) else {
        return;
    };
    let mut live: Vec<MemHandle> = Vec::new();

    for op in ops.into_iter().take(256) {
        match op {
            Op::Alloc { size, align_shift, rights } => {
                let alignment = 1u32 << (align_shift % 13);
                let rights = MemRights::from_bits(u32::from(rights) & 0x7F);
                if let Ok(mem) = system.alloc(ContextTag::NONE, u32::from(size), alignment, rights) {
                    assert_eq!(mem.addr() % u64::from(alignment), 0);
                    for other in &live {
                        assert!(mem.end() <= other.addr() || other.end() <= mem.addr());
                    }
                    live.push(mem);
                }
            }
            Op::Free { index } if !live.is_empty() => {
                let mem = live.swap_remove(usize::from(index) % live.len());
                system.free(mem).unwrap();
            }
            Op::Free { .. } => {}
            Op::NewPeriod => system.new_period(),
            Op::FreeUnused => {
                system.free_unused_memory();
            }
        }
        system.validate().unwrap();
    }

    for mem in live {
        system.free(mem).unwrap();
    }
    system.free_unused_memory();
    assert_eq!(system.total_allocated_size(), 0);
    assert_eq!(system.close(), 0);
    assert_eq!(backend.live_regions(), 0);
});
