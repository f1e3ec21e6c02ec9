//! Memory blocks for placed resources.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use prism_core::memory::{Memory, MemoryType};
use prism_core::{impl_query_interface, Result};

use crate::context::DeviceContext;

/// Alignment of standalone memory blocks; large enough for any resource.
const BLOCK_ALIGNMENT: u64 = 64 * 1024;

pub const fn memory_location(memory_type: MemoryType) -> MemoryLocation {
    match memory_type {
        MemoryType::Default => MemoryLocation::GpuOnly,
        MemoryType::Upload => MemoryLocation::CpuToGpu,
        MemoryType::Readback => MemoryLocation::GpuToCpu,
    }
}

/// A block allocated through gpu-allocator that resources bind into.
pub struct VulkanMemory {
    context: Arc<DeviceContext>,
    memory_type: MemoryType,
    size: u64,
    allocation: Mutex<Option<Allocation>>,
}

impl_query_interface!(VulkanMemory);

impl VulkanMemory {
    pub(crate) fn new(
        context: &Arc<DeviceContext>,
        size: u64,
        memory_type: MemoryType,
        memory_type_bits: u32,
    ) -> Result<Self> {
        let requirements = vk::MemoryRequirements {
            size,
            alignment: BLOCK_ALIGNMENT,
            memory_type_bits,
        };
        let allocation = context.allocate("memory block", requirements, memory_type, false)?;
        Ok(Self {
            context: Arc::clone(context),
            memory_type,
            size,
            allocation: Mutex::new(Some(allocation)),
        })
    }

    /// Native memory and the block's offset inside it.
    pub(crate) fn native(&self) -> (vk::DeviceMemory, u64) {
        let allocation = self.allocation.lock();
        allocation.as_ref().map_or((vk::DeviceMemory::null(), 0), |allocation| {
            // SAFETY: the memory outlives every resource bound into it,
            // since they hold this block.
            (unsafe { allocation.memory() }, allocation.offset())
        })
    }

    /// Host pointer to byte `offset` of the block, when host visible.
    pub(crate) fn mapped_ptr(&self, offset: u64) -> Option<NonNull<u8>> {
        let allocation = self.allocation.lock();
        let base = allocation.as_ref()?.mapped_ptr()?;
        let offset = usize::try_from(offset).ok()?;
        // SAFETY: the offset lies inside the mapped block.
        NonNull::new(unsafe { base.as_ptr().cast::<u8>().add(offset) })
    }
}

impl Memory for VulkanMemory {
    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for VulkanMemory {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.lock().take() {
            self.context.free(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_visible_types_map_to_cpu_locations() {
        assert_eq!(memory_location(MemoryType::Default), MemoryLocation::GpuOnly);
        assert_eq!(memory_location(MemoryType::Upload), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(MemoryType::Readback), MemoryLocation::GpuToCpu);
    }
}
