//! Resources: buffers, textures, samplers and acceleration structures.

use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::{Result, RhiError};
use crate::format::Format;
use crate::interface::QueryInterface;
use crate::memory::{Memory, MemoryRequirements, MemoryType};
use crate::state::{ResourceState, ResourceStateTracker};
use crate::upload::{self, TextureUploadLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceType {
    #[default]
    Unknown,
    Buffer,
    Texture,
    Sampler,
    AccelerationStructure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureType {
    Texture1D,
    #[default]
    Texture2D,
    Texture3D,
}

bitflags! {
    /// Ways a resource may be bound or used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlag: u32 {
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const SHADER_RESOURCE = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const CONSTANT_BUFFER = 1 << 5;
        const INDEX_BUFFER = 1 << 6;
        const VERTEX_BUFFER = 1 << 7;
        const ACCELERATION_STRUCTURE = 1 << 8;
        const RAY_TRACING = 1 << 9;
        const COPY_DEST = 1 << 10;
        const COPY_SOURCE = 1 << 11;
        const SHADING_RATE_SOURCE = 1 << 12;
        const SHADER_TABLE = 1 << 13;
        const INDIRECT_BUFFER = 1 << 14;
    }
}

/// Texture creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub texture_type: TextureType,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u16,
    pub mip_levels: u16,
    pub sample_count: u32,
    pub usage: BindFlag,
    /// `Some` commits memory at creation; `None` leaves the texture unbound.
    pub memory_type: Option<MemoryType>,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            texture_type: TextureType::Texture2D,
            format: Format::Rgba8Unorm,
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
            usage: BindFlag::SHADER_RESOURCE,
            memory_type: Some(MemoryType::Default),
        }
    }
}

impl TextureDesc {
    /// A committed, device-local 2D texture.
    pub fn new_2d(format: Format, width: u32, height: u32, usage: BindFlag) -> Self {
        Self {
            format,
            width,
            height,
            usage,
            ..Self::default()
        }
    }

    pub const fn with_mip_levels(mut self, mip_levels: u16) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub const fn with_array_layers(mut self, layers: u16) -> Self {
        self.depth_or_array_layers = layers;
        self
    }

    pub const fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub const fn with_memory_type(mut self, memory_type: Option<MemoryType>) -> Self {
        self.memory_type = memory_type;
        self
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BindFlag,
    /// `Some` commits memory at creation; `None` leaves the buffer unbound.
    pub memory_type: Option<MemoryType>,
}

impl BufferDesc {
    /// A buffer committed to `memory_type`.
    pub const fn new(size: u64, usage: BindFlag, memory_type: MemoryType) -> Self {
        Self {
            size,
            usage,
            memory_type: Some(memory_type),
        }
    }

    /// A buffer to be bound into a [`Memory`] block later.
    pub const fn placed(size: u64, usage: BindFlag) -> Self {
        Self {
            size,
            usage,
            memory_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerFilter {
    #[default]
    Anisotropic,
    MinMagMipLinear,
    ComparisonMinMagMipLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerTextureAddressMode {
    #[default]
    Wrap,
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerComparisonFunc {
    #[default]
    Never,
    Always,
    Less,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub filter: SamplerFilter,
    pub mode: SamplerTextureAddressMode,
    pub func: SamplerComparisonFunc,
}

/// State shared by every backend's resource implementation.
///
/// Backends embed one of these and return it from [`Resource::base`]; the
/// trait's provided methods answer the common getters from it.
#[derive(Debug)]
pub struct ResourceBase {
    pub resource_type: ResourceType,
    pub texture_type: TextureType,
    pub format: Format,
    pub width: u64,
    pub height: u32,
    pub layer_count: u16,
    pub level_count: u16,
    pub sample_count: u32,
    pub bind_flags: BindFlag,
    pub initial_state: ResourceState,
    pub is_back_buffer: bool,
    memory_type: Mutex<Option<MemoryType>>,
    name: Mutex<String>,
    state_tracker: Mutex<ResourceStateTracker>,
}

impl ResourceBase {
    pub fn new(
        resource_type: ResourceType,
        width: u64,
        height: u32,
        layer_count: u16,
        level_count: u16,
        initial_state: ResourceState,
    ) -> Self {
        Self {
            resource_type,
            texture_type: TextureType::Texture2D,
            format: Format::Undefined,
            width,
            height,
            layer_count,
            level_count,
            sample_count: 1,
            bind_flags: BindFlag::empty(),
            initial_state,
            is_back_buffer: false,
            memory_type: Mutex::new(None),
            name: Mutex::new(String::new()),
            state_tracker: Mutex::new(ResourceStateTracker::new(
                u32::from(level_count),
                u32::from(layer_count),
                initial_state,
            )),
        }
    }

    pub fn buffer(desc: &BufferDesc) -> Self {
        Self {
            bind_flags: desc.usage,
            ..Self::new(ResourceType::Buffer, desc.size, 1, 1, 1, ResourceState::COMMON)
        }
    }

    pub fn texture(desc: &TextureDesc) -> Self {
        let layer_count = match desc.texture_type {
            TextureType::Texture3D => 1,
            _ => desc.depth_or_array_layers,
        };
        Self {
            texture_type: desc.texture_type,
            format: desc.format,
            sample_count: desc.sample_count,
            bind_flags: desc.usage,
            ..Self::new(
                ResourceType::Texture,
                u64::from(desc.width),
                desc.height,
                layer_count,
                desc.mip_levels,
                ResourceState::UNDEFINED,
            )
        }
    }

    /// A swapchain image, created in the presentable state.
    pub fn back_buffer(desc: &TextureDesc) -> Self {
        let base = Self {
            is_back_buffer: true,
            initial_state: ResourceState::PRESENT,
            ..Self::texture(desc)
        };
        base.state_tracker.lock().set_resource_state(ResourceState::PRESENT);
        base.set_memory_type(MemoryType::Default);
        base
    }

    pub fn sampler() -> Self {
        Self::new(ResourceType::Sampler, 1, 1, 1, 1, ResourceState::UNKNOWN)
    }

    pub fn acceleration_structure() -> Self {
        Self::new(
            ResourceType::AccelerationStructure,
            1,
            1,
            1,
            1,
            ResourceState::RAYTRACING_ACCELERATION_STRUCTURE,
        )
    }

    pub fn memory_type(&self) -> Option<MemoryType> {
        *self.memory_type.lock()
    }

    pub fn set_memory_type(&self, memory_type: MemoryType) {
        *self.memory_type.lock() = Some(memory_type);
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        name.clone_into(&mut self.name.lock());
    }

    pub const fn state_tracker(&self) -> &Mutex<ResourceStateTracker> {
        &self.state_tracker
    }
}

/// A GPU resource.
///
/// Getters are provided from [`ResourceBase`]. Backends implement memory
/// binding, mapping and the native handle queries.
pub trait Resource: QueryInterface {
    fn base(&self) -> &ResourceBase;

    /// Allocate dedicated memory of `memory_type` and bind it.
    fn commit_memory(&self, memory_type: MemoryType) -> Result<()>;

    /// Bind the resource at `offset` inside a previously allocated block.
    fn bind_memory(&self, memory: &Arc<dyn Memory>, offset: u64) -> Result<()>;

    fn memory_requirements(&self) -> MemoryRequirements;

    /// Map the resource's memory. The pointer covers [`Resource::width`]
    /// bytes and stays valid until the matching [`Resource::unmap`].
    ///
    /// Only legal on Upload and Readback memory.
    fn map(&self) -> Result<NonNull<u8>>;

    fn unmap(&self);

    /// Opaque 64-bit handle that top-level instance records use to
    /// reference this structure. Zero for other resource types.
    fn acceleration_structure_handle(&self) -> u64 {
        0
    }

    /// Whether a queue may skip an explicit transition out of the common
    /// state into `state_after`.
    fn allow_common_state_promotion(&self, _state_after: ResourceState) -> bool {
        false
    }

    fn resource_type(&self) -> ResourceType {
        self.base().resource_type
    }

    fn format(&self) -> Format {
        self.base().format
    }

    /// Memory type the resource was committed or bound with; `Default`
    /// while unbound.
    fn memory_type(&self) -> MemoryType {
        self.base().memory_type().unwrap_or_default()
    }

    fn is_bound(&self) -> bool {
        self.base().memory_type().is_some()
    }

    fn width(&self) -> u64 {
        self.base().width
    }

    fn height(&self) -> u32 {
        self.base().height
    }

    fn layer_count(&self) -> u16 {
        self.base().layer_count
    }

    fn level_count(&self) -> u16 {
        self.base().level_count
    }

    fn sample_count(&self) -> u32 {
        self.base().sample_count
    }

    fn bind_flags(&self) -> BindFlag {
        self.base().bind_flags
    }

    fn initial_state(&self) -> ResourceState {
        self.base().initial_state
    }

    fn is_back_buffer(&self) -> bool {
        self.base().is_back_buffer
    }

    fn set_name(&self, name: &str) {
        self.base().set_name(name);
    }

    /// Bounds-checked copy of `data` into a mapped upload resource.
    fn update_upload_buffer(&self, offset: u64, data: &[u8]) -> Result<()> {
        with_mapped(self, |mapped| upload::write_bytes(mapped, offset, data))
    }

    /// Pitch-aware copy of texel rows into a mapped staging buffer.
    fn update_upload_buffer_with_texture_data(
        &self,
        layout: &TextureUploadLayout,
        src_data: &[u8],
    ) -> Result<()> {
        with_mapped(self, |mapped| upload::copy_texture_rows(mapped, src_data, layout))
    }

    /// Bounds-checked copy out of a mapped readback resource.
    fn read_readback_buffer(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        with_mapped(self, |mapped| upload::read_bytes(mapped, offset, out))
    }
}

fn with_mapped<R, F>(resource: &R, f: F) -> Result<()>
where
    R: Resource + ?Sized,
    F: FnOnce(&mut [u8]) -> Result<()>,
{
    let len = usize::try_from(resource.width())
        .map_err(|_| RhiError::InvalidState("Mapped size exceeds address space".to_string()))?;
    let ptr = resource.map()?;
    // SAFETY: `map` returns a pointer to `width()` bytes that stays valid
    // until `unmap`, and the mapping is not aliased while this borrow lives.
    let mapped = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
    let result = f(mapped);
    resource.unmap();
    result
}

/// Common-state promotion rule of queues that promote implicitly: buffers
/// promote to any state, textures only to read-only and copy states.
pub fn promotes_from_common(resource_type: ResourceType, state_after: ResourceState) -> bool {
    match resource_type {
        ResourceType::Buffer => true,
        ResourceType::Texture => (ResourceState::NON_PIXEL_SHADER_RESOURCE
            | ResourceState::PIXEL_SHADER_RESOURCE
            | ResourceState::COPY_DEST
            | ResourceState::COPY_SOURCE)
            .contains(state_after),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_base_counts_layers_not_depth_for_3d() {
        let desc = TextureDesc {
            texture_type: TextureType::Texture3D,
            depth_or_array_layers: 8,
            ..TextureDesc::default()
        };
        let base = ResourceBase::texture(&desc);
        assert_eq!(base.layer_count, 1);
        assert_eq!(base.initial_state, ResourceState::UNDEFINED);
        assert_eq!(base.memory_type(), None);
    }

    #[test]
    fn back_buffer_starts_presentable() {
        let desc = TextureDesc::new_2d(Format::Bgra8Unorm, 4, 4, BindFlag::RENDER_TARGET);
        let base = ResourceBase::back_buffer(&desc);
        assert!(base.is_back_buffer);
        assert_eq!(
            base.state_tracker().lock().resource_state(),
            Some(ResourceState::PRESENT)
        );
    }

    #[test]
    fn promotion_rules() {
        assert!(promotes_from_common(
            ResourceType::Buffer,
            ResourceState::UNORDERED_ACCESS
        ));
        assert!(promotes_from_common(
            ResourceType::Texture,
            ResourceState::COPY_DEST
        ));
        assert!(!promotes_from_common(
            ResourceType::Texture,
            ResourceState::RENDER_TARGET
        ));
        assert!(!promotes_from_common(
            ResourceType::Sampler,
            ResourceState::COPY_DEST
        ));
    }

    #[test]
    fn name_round_trips() {
        let base = ResourceBase::sampler();
        base.set_name("linear");
        assert_eq!(base.name(), "linear");
    }
}
