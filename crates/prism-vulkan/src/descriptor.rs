//! Descriptor types, writes and the device-wide bindless pools.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use prism_core::binding::ShaderStages;
use prism_core::descriptor_pool::{DescriptorPool, DescriptorStorage};
use prism_core::layout::descriptor_set::{DescriptorKind, DescriptorSetLimits};
use prism_core::{Result, RhiError};

use crate::capabilities::AdapterCapabilities;
use crate::error::{VkResult, VulkanError};

/// Upper bound of one bindless binding, whatever the driver allows.
pub const MAX_BINDLESS_DESCRIPTORS: u32 = 1 << 20;

pub const fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        DescriptorKind::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        DescriptorKind::InlineUniformBlock => vk::DescriptorType::INLINE_UNIFORM_BLOCK,
    }
}

pub fn shader_stage_flags(stages: ShaderStages) -> vk::ShaderStageFlags {
    if stages == ShaderStages::ALL {
        return vk::ShaderStageFlags::ALL;
    }
    let mut flags = vk::ShaderStageFlags::empty();
    for (stage, native) in [
        (ShaderStages::VERTEX, vk::ShaderStageFlags::VERTEX),
        (ShaderStages::PIXEL, vk::ShaderStageFlags::FRAGMENT),
        (ShaderStages::GEOMETRY, vk::ShaderStageFlags::GEOMETRY),
        (ShaderStages::COMPUTE, vk::ShaderStageFlags::COMPUTE),
        (ShaderStages::AMPLIFICATION, vk::ShaderStageFlags::TASK_EXT),
        (ShaderStages::MESH, vk::ShaderStageFlags::MESH_EXT),
        (
            ShaderStages::RAY_TRACING,
            vk::ShaderStageFlags::RAYGEN_KHR
                | vk::ShaderStageFlags::MISS_KHR
                | vk::ShaderStageFlags::CLOSEST_HIT_KHR
                | vk::ShaderStageFlags::ANY_HIT_KHR
                | vk::ShaderStageFlags::INTERSECTION_KHR
                | vk::ShaderStageFlags::CALLABLE_KHR,
        ),
    ] {
        if stages.contains(stage) {
            flags |= native;
        }
    }
    flags
}

/// Limits the descriptor-set planner works within on this adapter.
///
/// Only kinds with a bindless pool get a bindless count.
pub fn descriptor_set_limits(
    capabilities: &AdapterCapabilities,
    bindless_kinds: &[DescriptorKind],
    inline_uniform_blocks: bool,
) -> DescriptorSetLimits {
    let (max_inline_uniform_block_size, max_inline_uniform_blocks) = if inline_uniform_blocks {
        (
            capabilities.max_inline_uniform_block_size,
            capabilities.max_descriptor_set_inline_uniform_blocks,
        )
    } else {
        (0, 0)
    };
    DescriptorSetLimits {
        max_inline_uniform_block_size,
        max_inline_uniform_blocks,
        max_bindless_descriptors: bindless_kinds
            .iter()
            .map(|&kind| (kind, bindless_limit(capabilities, kind)))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn bindless_limit(capabilities: &AdapterCapabilities, kind: DescriptorKind) -> u32 {
    let driver_limit = match kind {
        DescriptorKind::Sampler => capabilities.max_update_after_bind_samplers,
        DescriptorKind::SampledImage | DescriptorKind::UniformTexelBuffer => {
            capabilities.max_update_after_bind_sampled_images
        }
        DescriptorKind::StorageImage | DescriptorKind::StorageTexelBuffer => {
            capabilities.max_update_after_bind_storage_images
        }
        DescriptorKind::StorageBuffer => capabilities.max_update_after_bind_storage_buffers,
        DescriptorKind::UniformBuffer => capabilities.max_update_after_bind_uniform_buffers,
        DescriptorKind::AccelerationStructure => {
            capabilities.max_update_after_bind_acceleration_structures
        }
        DescriptorKind::InlineUniformBlock => 0,
    };
    driver_limit.min(MAX_BINDLESS_DESCRIPTORS)
}

/// Native contents of one descriptor, kept by views so they can be written
/// into any set or pool slot.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    Image(vk::DescriptorImageInfo),
    Buffer(vk::DescriptorBufferInfo),
    TexelBuffer(vk::BufferView),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// Write one descriptor into `set`.
///
/// # Safety
/// `set` must not be in use by the GPU unless its layout was created with
/// update-after-bind for this binding.
pub unsafe fn write_descriptor(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    array_element: u32,
    descriptor_type: vk::DescriptorType,
    descriptor: &DescriptorWrite,
) {
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(array_element)
        .descriptor_type(descriptor_type);
    match descriptor {
        DescriptorWrite::Image(info) => {
            let infos = [*info];
            unsafe { device.update_descriptor_sets(&[write.image_info(&infos)], &[]) };
        }
        DescriptorWrite::Buffer(info) => {
            let infos = [*info];
            unsafe { device.update_descriptor_sets(&[write.buffer_info(&infos)], &[]) };
        }
        DescriptorWrite::TexelBuffer(view) => {
            let views = [*view];
            unsafe { device.update_descriptor_sets(&[write.texel_buffer_view(&views)], &[]) };
        }
        DescriptorWrite::AccelerationStructure(handle) => {
            let handles = [*handle];
            let mut acceleration_structures =
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(&handles);
            let mut write = write.push_next(&mut acceleration_structures);
            write.descriptor_count = 1;
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }
    }
}

/// Bytes of an inline uniform block.
///
/// # Safety
/// Same as [`write_descriptor`]; inline blocks are never update-after-bind.
pub unsafe fn write_inline_uniform_block(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    data: &[u8],
) {
    let mut block = vk::WriteDescriptorSetInlineUniformBlock::default().data(data);
    let mut write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::INLINE_UNIFORM_BLOCK)
        .push_next(&mut block);
    write.descriptor_count = data.len() as u32;
    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// One variable-count, update-after-bind descriptor set per kind.
///
/// Growing allocates a larger set from a new pool and replays every
/// preserved slot into it. Retired pools stay alive until the storage is
/// dropped, since recorded command buffers may still reference their sets.
pub struct BindlessStorage {
    device: ash::Device,
    descriptor_type: vk::DescriptorType,
    max_count: u32,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    capacity: u32,
    slots: Vec<Option<DescriptorWrite>>,
    retired: Vec<vk::DescriptorPool>,
}

// SAFETY: descriptor handles are plain identifiers; all mutation goes
// through the owning `DescriptorPool`'s lock.
unsafe impl Send for BindlessStorage {}

impl BindlessStorage {
    /// Create the set layout shared by every generation of the set.
    ///
    /// # Safety
    /// The device must be valid and outlive the storage.
    pub unsafe fn new(device: &ash::Device, kind: DescriptorKind, max_count: u32) -> VkResult<Self> {
        let descriptor_type = descriptor_type(kind);
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(descriptor_type)
            .descriptor_count(max_count)
            .stage_flags(vk::ShaderStageFlags::ALL)];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { device.create_descriptor_set_layout(&create_info, None) }?;
        Ok(Self {
            device: device.clone(),
            descriptor_type,
            max_count,
            layout,
            pool: vk::DescriptorPool::null(),
            set: vk::DescriptorSet::null(),
            capacity: 0,
            slots: Vec::new(),
            retired: Vec::new(),
        })
    }

    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Set of the current generation; null until the first grow.
    pub const fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub const fn descriptor_type(&self) -> vk::DescriptorType {
        self.descriptor_type
    }

    /// Write `descriptor` into `slot` of the current set.
    pub fn write(&mut self, slot: u32, descriptor: &DescriptorWrite) {
        prism_core::require!(
            slot < self.capacity,
            "bindless slot {slot} outside a pool of {}",
            self.capacity
        );
        self.slots[slot as usize] = Some(*descriptor);
        // SAFETY: the binding is update-after-bind and partially bound.
        unsafe {
            write_descriptor(&self.device, self.set, 0, slot, self.descriptor_type, descriptor);
        }
    }

    unsafe fn allocate_set(&self, capacity: u32) -> VkResult<(vk::DescriptorPool, vk::DescriptorSet)> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: self.descriptor_type,
            descriptor_count: capacity,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }?;

        let counts = [capacity];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let layouts = [self.layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .push_next(&mut variable_info);
        match unsafe { self.device.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => Ok((pool, sets[0])),
            Err(e) => {
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
                Err(VulkanError::from(e))
            }
        }
    }
}

impl DescriptorStorage for BindlessStorage {
    fn grow(&mut self, capacity: u32, preserved: u32) -> Result<()> {
        if capacity <= self.capacity {
            return Ok(());
        }
        if capacity > self.max_count {
            return Err(RhiError::DescriptorPoolExhausted(format!(
                "{:?} pool cannot grow past {} descriptors",
                self.descriptor_type, self.max_count
            )));
        }
        let (pool, set) = unsafe { self.allocate_set(capacity) }?;
        tracing::debug!(
            descriptor_type = ?self.descriptor_type,
            from = self.capacity,
            to = capacity,
            "Growing bindless pool"
        );
        if self.pool != vk::DescriptorPool::null() {
            self.retired.push(self.pool);
        }
        self.pool = pool;
        self.set = set;
        self.capacity = capacity;
        self.slots.resize(capacity as usize, None);
        for (slot, descriptor) in self.slots.iter().enumerate().take(preserved as usize) {
            if let Some(descriptor) = descriptor {
                // SAFETY: the new set has never been bound.
                unsafe {
                    write_descriptor(
                        &self.device,
                        set,
                        0,
                        slot as u32,
                        self.descriptor_type,
                        descriptor,
                    );
                }
            }
        }
        Ok(())
    }
}

impl Drop for BindlessStorage {
    fn drop(&mut self) {
        unsafe {
            for pool in self.retired.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            if self.pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(self.pool, None);
            }
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

pub type BindlessPool = DescriptorPool<BindlessStorage>;

/// Create one bindless pool per kind, each sized to `initial_capacity`.
///
/// # Safety
/// The device must be valid and outlive the pools.
pub unsafe fn create_bindless_pools(
    device: &ash::Device,
    limits: &DescriptorSetLimits,
    initial_capacity: u32,
) -> Result<hashbrown::HashMap<DescriptorKind, Arc<BindlessPool>>> {
    let mut pools = hashbrown::HashMap::new();
    for (&kind, &max_count) in &limits.max_bindless_descriptors {
        if max_count == 0 {
            continue;
        }
        let mut storage =
            unsafe { BindlessStorage::new(device, kind, max_count) }.map_err(RhiError::from)?;
        storage.grow(initial_capacity.clamp(1, max_count), 0)?;
        pools.insert(kind, DescriptorPool::new(storage, Some(max_count)));
    }
    Ok(pools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_native_type() {
        assert_eq!(
            descriptor_type(DescriptorKind::SampledImage),
            vk::DescriptorType::SAMPLED_IMAGE
        );
        assert_eq!(
            descriptor_type(DescriptorKind::InlineUniformBlock),
            vk::DescriptorType::INLINE_UNIFORM_BLOCK
        );
        assert_eq!(
            descriptor_type(DescriptorKind::AccelerationStructure),
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
    }

    #[test]
    fn stage_masks() {
        assert_eq!(shader_stage_flags(ShaderStages::ALL), vk::ShaderStageFlags::ALL);
        assert_eq!(
            shader_stage_flags(ShaderStages::VERTEX | ShaderStages::PIXEL),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert!(shader_stage_flags(ShaderStages::RAY_TRACING)
            .contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
    }
}
