//! Buffers, images, samplers and acceleration structures.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use parking_lot::Mutex;
use prism_core::acceleration::{AccelerationStructureType, ACCELERATION_STRUCTURE_ALIGNMENT};
use prism_core::interface::cast_arc;
use prism_core::memory::{Memory, MemoryRequirements, MemoryType};
use prism_core::resource::{
    BindFlag, BufferDesc, Resource, ResourceBase, ResourceType, SamplerComparisonFunc, SamplerDesc,
    SamplerFilter, SamplerTextureAddressMode, TextureDesc, TextureType,
};
use prism_core::{impl_query_interface, require, Result, RhiError};

use crate::acceleration::acceleration_structure_type;
use crate::context::DeviceContext;
use crate::error::VulkanError;
use crate::format::{aspect_flags, to_vk_format};
use crate::memory::VulkanMemory;

/// Where a resource's memory comes from.
enum Backing {
    Unbound,
    Committed(Allocation),
    Placed { memory: Arc<VulkanMemory>, offset: u64 },
    /// Owned by someone else, e.g. the presentation engine.
    External,
}

pub struct AccelerationStructureData {
    pub handle: vk::AccelerationStructureKHR,
    pub as_type: AccelerationStructureType,
    /// Buffer the structure lives in; kept alive by the structure.
    pub buffer: Arc<VulkanResource>,
    pub offset: u64,
    pub size: u64,
    pub address: u64,
}

pub enum Native {
    Buffer(vk::Buffer),
    Image {
        image: vk::Image,
        owned: bool,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    },
    Sampler(vk::Sampler),
    AccelerationStructure(AccelerationStructureData),
}

pub struct VulkanResource {
    base: ResourceBase,
    context: Arc<DeviceContext>,
    native: Native,
    requirements: vk::MemoryRequirements,
    backing: Mutex<Backing>,
    device_address: AtomicU64,
}

impl_query_interface!(VulkanResource);

pub(crate) fn vulkan_resource(resource: &Arc<dyn Resource>) -> Arc<VulkanResource> {
    cast_arc::<VulkanResource>(Arc::clone(resource).into_any())
}

fn buffer_usage(usage: BindFlag, ray_tracing: bool) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    if usage.contains(BindFlag::CONSTANT_BUFFER) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BindFlag::UNORDERED_ACCESS) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
    }
    if usage.contains(BindFlag::SHADER_RESOURCE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER;
    }
    if usage.contains(BindFlag::INDEX_BUFFER) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BindFlag::VERTEX_BUFFER) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BindFlag::INDIRECT_BUFFER) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if ray_tracing {
        if usage.contains(BindFlag::ACCELERATION_STRUCTURE) {
            flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
        }
        if usage.contains(BindFlag::RAY_TRACING) {
            flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if usage.contains(BindFlag::SHADER_TABLE) {
            flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
        }
    }
    flags
}

fn image_usage(usage: BindFlag) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(BindFlag::SHADER_RESOURCE) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(BindFlag::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(BindFlag::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(BindFlag::UNORDERED_ACCESS) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(BindFlag::SHADING_RATE_SOURCE) {
        flags |= vk::ImageUsageFlags::FRAGMENT_SHADING_RATE_ATTACHMENT_KHR;
    }
    flags
}

const fn image_type(texture_type: TextureType) -> vk::ImageType {
    match texture_type {
        TextureType::Texture1D => vk::ImageType::TYPE_1D,
        TextureType::Texture2D => vk::ImageType::TYPE_2D,
        TextureType::Texture3D => vk::ImageType::TYPE_3D,
    }
}

const fn compare_op(func: SamplerComparisonFunc) -> vk::CompareOp {
    match func {
        SamplerComparisonFunc::Never => vk::CompareOp::NEVER,
        SamplerComparisonFunc::Always => vk::CompareOp::ALWAYS,
        SamplerComparisonFunc::Less => vk::CompareOp::LESS,
    }
}

const fn address_mode(mode: SamplerTextureAddressMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerTextureAddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        SamplerTextureAddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    }
}

impl VulkanResource {
    fn with_native(
        base: ResourceBase,
        context: &Arc<DeviceContext>,
        native: Native,
        requirements: vk::MemoryRequirements,
        backing: Backing,
    ) -> Self {
        Self {
            base,
            context: Arc::clone(context),
            native,
            requirements,
            backing: Mutex::new(backing),
            device_address: AtomicU64::new(0),
        }
    }

    pub fn new_buffer(context: &Arc<DeviceContext>, desc: &BufferDesc) -> Result<Arc<Self>> {
        let usage = buffer_usage(desc.usage, context.features.ray_tracing);
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { context.device.create_buffer(&create_info, None) }
            .map_err(VulkanError::from)?;
        let requirements = unsafe { context.device.get_buffer_memory_requirements(buffer) };
        let resource = Arc::new(Self::with_native(
            ResourceBase::buffer(desc),
            context,
            Native::Buffer(buffer),
            requirements,
            Backing::Unbound,
        ));
        if let Some(memory_type) = desc.memory_type {
            resource.commit_memory(memory_type)?;
        }
        Ok(resource)
    }

    pub fn new_texture(context: &Arc<DeviceContext>, desc: &TextureDesc) -> Result<Arc<Self>> {
        let format = to_vk_format(desc.format);
        let (depth, layers) = match desc.texture_type {
            TextureType::Texture3D => (u32::from(desc.depth_or_array_layers), 1),
            _ => (1, u32::from(desc.depth_or_array_layers)),
        };
        let mut flags = vk::ImageCreateFlags::empty();
        if desc.texture_type == TextureType::Texture2D && layers >= 6 && layers % 6 == 0 {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type(desc.texture_type))
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth,
            })
            .mip_levels(u32::from(desc.mip_levels))
            .array_layers(layers)
            .samples(vk::SampleCountFlags::from_raw(desc.sample_count.max(1)))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { context.device.create_image(&create_info, None) }
            .map_err(VulkanError::from)?;
        let requirements = unsafe { context.device.get_image_memory_requirements(image) };
        let resource = Arc::new(Self::with_native(
            ResourceBase::texture(desc),
            context,
            Native::Image {
                image,
                owned: true,
                format,
                aspect: aspect_flags(desc.format),
            },
            requirements,
            Backing::Unbound,
        ));
        if let Some(memory_type) = desc.memory_type {
            resource.commit_memory(memory_type)?;
        }
        Ok(resource)
    }

    /// Wrap a presentation-engine image.
    pub(crate) fn new_back_buffer(
        context: &Arc<DeviceContext>,
        desc: &TextureDesc,
        image: vk::Image,
    ) -> Arc<Self> {
        Arc::new(Self::with_native(
            ResourceBase::back_buffer(desc),
            context,
            Native::Image {
                image,
                owned: false,
                format: to_vk_format(desc.format),
                aspect: vk::ImageAspectFlags::COLOR,
            },
            vk::MemoryRequirements::default(),
            Backing::External,
        ))
    }

    pub fn new_sampler(context: &Arc<DeviceContext>, desc: &SamplerDesc) -> Result<Arc<Self>> {
        let mode = address_mode(desc.mode);
        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(mode)
            .address_mode_v(mode)
            .address_mode_w(mode)
            .compare_op(compare_op(desc.func))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        match desc.filter {
            SamplerFilter::Anisotropic if context.features.sampler_anisotropy => {
                create_info = create_info.anisotropy_enable(true).max_anisotropy(16.0);
            }
            SamplerFilter::ComparisonMinMagMipLinear => {
                create_info = create_info.compare_enable(true);
            }
            SamplerFilter::Anisotropic | SamplerFilter::MinMagMipLinear => {}
        }
        let sampler = unsafe { context.device.create_sampler(&create_info, None) }
            .map_err(VulkanError::from)?;
        let base = ResourceBase::sampler();
        base.set_memory_type(MemoryType::Default);
        Ok(Arc::new(Self::with_native(
            base,
            context,
            Native::Sampler(sampler),
            vk::MemoryRequirements::default(),
            Backing::External,
        )))
    }

    /// Place an acceleration structure inside `buffer` at `offset`.
    pub fn new_acceleration_structure(
        context: &Arc<DeviceContext>,
        as_type: AccelerationStructureType,
        buffer: Arc<Self>,
        offset: u64,
    ) -> Result<Arc<Self>> {
        let Some(loader) = &context.acceleration_structure_loader else {
            return Err(RhiError::ExtensionNotSupported(
                "VK_KHR_acceleration_structure".to_string(),
            ));
        };
        require!(
            buffer.resource_type() == ResourceType::Buffer,
            "acceleration structures live in buffers, not {:?} resources",
            buffer.resource_type()
        );
        require!(
            offset % ACCELERATION_STRUCTURE_ALIGNMENT == 0,
            "acceleration structure offset {offset} is not {ACCELERATION_STRUCTURE_ALIGNMENT}-byte aligned"
        );
        require!(
            offset < buffer.width(),
            "acceleration structure offset {offset} past the end of a {}-byte buffer",
            buffer.width()
        );
        let size = buffer.width() - offset;
        let ty = acceleration_structure_type(as_type);
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer())
            .offset(offset)
            .size(size)
            .ty(ty);
        let handle = unsafe { loader.create_acceleration_structure(&create_info, None) }
            .map_err(VulkanError::from)?;
        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        let base = ResourceBase::acceleration_structure();
        base.set_memory_type(MemoryType::Default);
        let resource = Self::with_native(
            base,
            context,
            Native::AccelerationStructure(AccelerationStructureData {
                handle,
                as_type,
                buffer,
                offset,
                size,
                address,
            }),
            vk::MemoryRequirements::default(),
            Backing::External,
        );
        resource.device_address.store(address, Ordering::Release);
        Ok(Arc::new(resource))
    }

    pub const fn native(&self) -> &Native {
        &self.native
    }

    pub fn buffer(&self) -> vk::Buffer {
        match &self.native {
            Native::Buffer(buffer) => *buffer,
            _ => prism_core::contract_violation!(
                "{:?} resource used where a buffer is required",
                self.resource_type()
            ),
        }
    }

    /// Image handle, native format and aspect.
    pub fn image(&self) -> (vk::Image, vk::Format, vk::ImageAspectFlags) {
        match &self.native {
            Native::Image {
                image,
                format,
                aspect,
                ..
            } => (*image, *format, *aspect),
            _ => prism_core::contract_violation!(
                "{:?} resource used where a texture is required",
                self.resource_type()
            ),
        }
    }

    pub fn sampler(&self) -> vk::Sampler {
        match &self.native {
            Native::Sampler(sampler) => *sampler,
            _ => prism_core::contract_violation!(
                "{:?} resource used where a sampler is required",
                self.resource_type()
            ),
        }
    }

    pub fn acceleration_structure(&self) -> &AccelerationStructureData {
        match &self.native {
            Native::AccelerationStructure(data) => data,
            _ => prism_core::contract_violation!(
                "{:?} resource used where an acceleration structure is required",
                self.resource_type()
            ),
        }
    }

    /// Device address of a bound buffer or of an acceleration structure.
    pub fn device_address(&self) -> u64 {
        let address = self.device_address.load(Ordering::Acquire);
        require!(
            address != 0,
            "device address of an unbound {:?} resource",
            self.resource_type()
        );
        address
    }

    fn bind_native(&self, memory: vk::DeviceMemory, offset: u64) -> Result<()> {
        let device = &self.context.device;
        match &self.native {
            Native::Buffer(buffer) => {
                unsafe { device.bind_buffer_memory(*buffer, memory, offset) }
                    .map_err(VulkanError::from)?;
                let info = vk::BufferDeviceAddressInfo::default().buffer(*buffer);
                let address = unsafe { device.get_buffer_device_address(&info) };
                self.device_address.store(address, Ordering::Release);
            }
            Native::Image { image, .. } => {
                unsafe { device.bind_image_memory(*image, memory, offset) }
                    .map_err(VulkanError::from)?;
            }
            Native::Sampler(_) | Native::AccelerationStructure(_) => prism_core::contract_violation!(
                "{:?} resources have no memory of their own",
                self.resource_type()
            ),
        }
        Ok(())
    }
}

impl Resource for VulkanResource {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn commit_memory(&self, memory_type: MemoryType) -> Result<()> {
        let mut backing = self.backing.lock();
        require!(
            matches!(*backing, Backing::Unbound),
            "memory committed to an already bound {:?} resource",
            self.resource_type()
        );
        let linear = matches!(self.native, Native::Buffer(_));
        let name = self.base.name();
        let name = if name.is_empty() { "committed resource" } else { name.as_str() };
        let allocation = self
            .context
            .allocate(name, self.requirements, memory_type, linear)?;
        // SAFETY: the allocation is freed only after the resource is destroyed.
        let (memory, offset) = (unsafe { allocation.memory() }, allocation.offset());
        if let Err(e) = self.bind_native(memory, offset) {
            self.context.free(allocation);
            return Err(e);
        }
        *backing = Backing::Committed(allocation);
        self.base.set_memory_type(memory_type);
        Ok(())
    }

    fn bind_memory(&self, memory: &Arc<dyn Memory>, offset: u64) -> Result<()> {
        let memory = cast_arc::<VulkanMemory>(Arc::clone(memory).into_any());
        let mut backing = self.backing.lock();
        require!(
            matches!(*backing, Backing::Unbound),
            "memory bound to an already bound {:?} resource",
            self.resource_type()
        );
        require!(
            self.requirements.alignment == 0 || offset % self.requirements.alignment == 0,
            "bind offset {offset} violates alignment {}",
            self.requirements.alignment
        );
        require!(
            offset + self.requirements.size <= memory.size(),
            "{} bytes at offset {offset} overrun a {}-byte memory block",
            self.requirements.size,
            memory.size()
        );
        let (native_memory, block_offset) = memory.native();
        self.bind_native(native_memory, block_offset + offset)?;
        self.base.set_memory_type(memory.memory_type());
        *backing = Backing::Placed { memory, offset };
        Ok(())
    }

    fn memory_requirements(&self) -> MemoryRequirements {
        MemoryRequirements {
            size: self.requirements.size,
            alignment: self.requirements.alignment,
            memory_type_bits: self.requirements.memory_type_bits,
        }
    }

    fn map(&self) -> Result<NonNull<u8>> {
        let backing = self.backing.lock();
        let ptr = match &*backing {
            Backing::Committed(allocation) => allocation.mapped_ptr().map(NonNull::cast::<u8>),
            Backing::Placed { memory, offset } => memory.mapped_ptr(*offset),
            Backing::Unbound | Backing::External => None,
        };
        ptr.ok_or_else(|| {
            RhiError::InvalidState(format!(
                "{:?} memory of a {:?} resource is not host visible",
                self.memory_type(),
                self.resource_type()
            ))
        })
    }

    // Host-visible memory stays persistently mapped.
    fn unmap(&self) {}

    fn acceleration_structure_handle(&self) -> u64 {
        match &self.native {
            Native::AccelerationStructure(data) => data.address,
            _ => 0,
        }
    }

    fn set_name(&self, name: &str) {
        self.base.set_name(name);
        match &self.native {
            Native::Buffer(buffer) => self.context.set_object_name(*buffer, name),
            Native::Image { image, .. } => self.context.set_object_name(*image, name),
            Native::Sampler(sampler) => self.context.set_object_name(*sampler, name),
            Native::AccelerationStructure(data) => self.context.set_object_name(data.handle, name),
        }
    }
}

impl Drop for VulkanResource {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            match &self.native {
                Native::Buffer(buffer) => device.destroy_buffer(*buffer, None),
                Native::Image { image, owned: true, .. } => device.destroy_image(*image, None),
                Native::Image { owned: false, .. } => {}
                Native::Sampler(sampler) => device.destroy_sampler(*sampler, None),
                Native::AccelerationStructure(data) => {
                    if let Some(loader) = &self.context.acceleration_structure_loader {
                        loader.destroy_acceleration_structure(data.handle, None);
                    }
                }
            }
        }
        if let Backing::Committed(allocation) =
            std::mem::replace(self.backing.get_mut(), Backing::Unbound)
        {
            self.context.free(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_always_copyable_and_addressable() {
        let flags = buffer_usage(BindFlag::empty(), false);
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }

    #[test]
    fn ray_tracing_usage_needs_the_feature() {
        let usage = BindFlag::ACCELERATION_STRUCTURE | BindFlag::SHADER_TABLE;
        assert!(!buffer_usage(usage, false)
            .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR));
        let flags = buffer_usage(usage, true);
        assert!(flags.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
    }

    #[test]
    fn image_usage_follows_bind_flags() {
        let flags = image_usage(BindFlag::RENDER_TARGET | BindFlag::SHADER_RESOURCE);
        assert!(flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(flags.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(!flags.contains(vk::ImageUsageFlags::STORAGE));
    }

    #[test]
    fn sampler_modes() {
        assert_eq!(
            address_mode(SamplerTextureAddressMode::Clamp),
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        );
        assert_eq!(compare_op(SamplerComparisonFunc::Less), vk::CompareOp::LESS);
        assert_eq!(image_type(TextureType::Texture3D), vk::ImageType::TYPE_3D);
    }
}
