// Copyright 2024-2026 gpu-base Contributors
// Licensed under the Apache License, Version 2.0

//! Descriptor pooling for block metadata reuse.
//!
//! Uses parking_lot::Mutex; the lock is only held for a push or a pop and may
//! be taken while a bank lock is held, never the other way around.

use std::sync::Arc;

use parking_lot::Mutex;

use super::backend::MemBackend;
use super::block::BlockDescriptor;
use super::error::MemError;

/// Bounded free list of [`BlockDescriptor`] storage.
pub struct DescriptorPool {
    free: Mutex<Vec<Box<BlockDescriptor>>>,
    capacity: usize,
    backend: Arc<dyn MemBackend>,
}

impl DescriptorPool {
    pub fn new(backend: Arc<dyn MemBackend>, capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            backend,
        }
    }

    /// Fill the pool up to capacity from the backend.
    pub fn prefill(&self) -> Result<(), MemError> {
        let mut free = self.free.lock();
        while free.len() < self.capacity {
            let descriptor = self.backend.allocate_descriptor().ok_or(MemError::OutOfMemory)?;
            free.push(descriptor);
        }
        Ok(())
    }

    /// Pop a cleared descriptor, or ask the backend for a fresh one.
    pub fn get(&self) -> Option<Box<BlockDescriptor>> {
        if let Some(descriptor) = self.free.lock().pop() {
            return Some(descriptor);
        }
        self.backend.allocate_descriptor()
    }

    /// Clear `descriptor` and keep it if there is room, else free it.
    pub fn release(&self, mut descriptor: Box<BlockDescriptor>) {
        descriptor.clear();
        let overflow = {
            let mut free = self.free.lock();
            if free.len() < self.capacity {
                free.push(descriptor);
                None
            } else {
                Some(descriptor)
            }
        };
        if let Some(descriptor) = overflow {
            self.backend.free_descriptor(descriptor);
        }
    }

    /// Hand every pooled descriptor back to the backend.
    pub fn release_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.free.lock());
        for descriptor in drained {
            self.backend.free_descriptor(descriptor);
        }
    }

    /// Current number of pooled descriptors.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::backend::MockBackend;

    fn pool(capacity: usize) -> (Arc<MockBackend>, DescriptorPool) {
        let backend = Arc::new(MockBackend::single_bank(1 << 20, 20));
        let pool = DescriptorPool::new(backend.clone(), capacity);
        (backend, pool)
    }

    #[test]
    fn prefill_fills_to_capacity() {
        let (backend, pool) = pool(4);
        pool.prefill().unwrap();
        assert_eq!(pool.available(), 4);
        assert_eq!(backend.descriptors_outstanding(), 4);
    }

    #[test]
    fn prefill_reports_host_exhaustion() {
        let (backend, pool) = pool(4);
        backend.set_descriptor_budget(Some(2));
        assert_eq!(pool.prefill(), Err(MemError::OutOfMemory));
    }

    #[test]
    fn release_clears_and_recycles() {
        let (_backend, pool) = pool(2);
        let mut d = pool.get().unwrap();
        d.start = 0x1000;
        d.size = 64;
        pool.release(d);
        assert_eq!(pool.available(), 1);
        let d = pool.get().unwrap();
        assert_eq!((d.start, d.size), (0, 0));
    }

    #[test]
    fn overflow_goes_back_to_backend() {
        let (backend, pool) = pool(1);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(backend.descriptors_outstanding(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(backend.descriptors_outstanding(), 1);
        pool.release_all();
        assert_eq!(backend.descriptors_outstanding(), 0);
    }
}
