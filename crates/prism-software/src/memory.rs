//! Host-memory backed allocations.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::memory::{Memory, MemoryBudget, MemoryType};
use prism_core::{impl_query_interface, Result, RhiError};

/// Device-wide usage accounting against the configured budget.
#[derive(Debug)]
pub struct MemoryAccounting {
    budget: u64,
    usage: AtomicU64,
}

impl MemoryAccounting {
    pub const fn new(budget: u64) -> Self {
        Self {
            budget,
            usage: AtomicU64::new(0),
        }
    }

    fn reserve(&self, size: u64) -> Result<()> {
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                usage.checked_add(size).filter(|total| *total <= self.budget)
            })
            .map(|_| ())
            .map_err(|usage| {
                RhiError::AllocationFailed(format!(
                    "{size} bytes requested with {usage} of {} bytes in use",
                    self.budget
                ))
            })
    }

    fn release(&self, size: u64) {
        self.usage.fetch_sub(size, Ordering::AcqRel);
    }

    pub fn budget(&self) -> MemoryBudget {
        MemoryBudget {
            budget: self.budget,
            usage: self.usage.load(Ordering::Acquire),
        }
    }
}

/// A block of host memory standing in for a GPU heap.
pub struct SoftwareMemory {
    memory_type: MemoryType,
    bytes: Mutex<Box<[u8]>>,
    accounting: Arc<MemoryAccounting>,
}

impl_query_interface!(SoftwareMemory);

impl SoftwareMemory {
    pub fn allocate(accounting: &Arc<MemoryAccounting>, size: u64, memory_type: MemoryType) -> Result<Arc<Self>> {
        let len = usize::try_from(size)
            .map_err(|_| RhiError::AllocationFailed(format!("{size} bytes exceed the address space")))?;
        accounting.reserve(size)?;
        Ok(Arc::new(Self {
            memory_type,
            bytes: Mutex::new(vec![0; len].into_boxed_slice()),
            accounting: Arc::clone(accounting),
        }))
    }

    /// Run `f` over `len` bytes starting at `offset`.
    pub fn with_bytes<R>(&self, offset: u64, len: u64, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + len as usize;
        prism_core::require!(
            end <= bytes.len(),
            "access of {len} bytes at {offset} overruns a {}-byte allocation",
            bytes.len()
        );
        f(&mut bytes[start..end])
    }

    /// Stable pointer to the byte at `offset`.
    pub(crate) fn pointer(&self, offset: u64) -> NonNull<u8> {
        let mut bytes = self.bytes.lock();
        prism_core::require!((offset as usize) <= bytes.len(), "mapping offset {offset} out of range");
        // SAFETY: `offset` is within the allocation, which is never resized.
        let ptr = unsafe { bytes.as_mut_ptr().add(offset as usize) };
        NonNull::new(ptr).unwrap_or(NonNull::dangling())
    }
}

impl Memory for SoftwareMemory {
    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn size(&self) -> u64 {
        self.bytes.lock().len() as u64
    }
}

impl Drop for SoftwareMemory {
    fn drop(&mut self) {
        self.accounting.release(self.bytes.get_mut().len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced_and_released() {
        let accounting = Arc::new(MemoryAccounting::new(1024));
        let first = SoftwareMemory::allocate(&accounting, 768, MemoryType::Default).unwrap();
        assert!(matches!(
            SoftwareMemory::allocate(&accounting, 512, MemoryType::Upload),
            Err(RhiError::AllocationFailed(_))
        ));
        assert_eq!(accounting.budget().usage, 768);
        drop(first);
        assert_eq!(accounting.budget().available(), 1024);
    }

    #[test]
    fn bytes_start_zeroed() {
        let accounting = Arc::new(MemoryAccounting::new(64));
        let memory = SoftwareMemory::allocate(&accounting, 16, MemoryType::Readback).unwrap();
        memory.with_bytes(4, 4, |bytes| bytes.copy_from_slice(&[1, 2, 3, 4]));
        memory.with_bytes(0, 16, |bytes| {
            assert_eq!(&bytes[..8], &[0, 0, 0, 0, 1, 2, 3, 4]);
        });
    }
}
