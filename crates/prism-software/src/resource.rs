//! Buffers, textures, samplers and acceleration structures in host memory.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, ACCELERATION_STRUCTURE_ALIGNMENT,
};
use prism_core::interface::cast_arc;
use prism_core::memory::{Memory, MemoryRequirements, MemoryType};
use prism_core::resource::{
    promotes_from_common, BufferDesc, Resource, ResourceBase, SamplerDesc, TextureDesc,
};
use prism_core::state::ResourceState;
use prism_core::{impl_query_interface, require, Result};

use crate::memory::{MemoryAccounting, SoftwareMemory};
use crate::texel::TextureLayout;

/// Placement alignment reported for every resource.
pub const RESOURCE_ALIGNMENT: u64 = 256;

/// Every memory type is usable for every resource.
const MEMORY_TYPE_BITS: u32 = 0b111;

/// Start of the fake address range acceleration-structure handles live in.
const ACCELERATION_STRUCTURE_HANDLE_BASE: u64 = 0x0001_0000_0000;

/// Result of a completed acceleration-structure build or copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltStructure {
    pub size: u64,
    pub compacted_size: u64,
    /// Triangles of a bottom-level structure, instances of a top-level one.
    pub element_count: u32,
    pub flags: BuildAccelerationStructureFlags,
}

pub struct AccelerationStructureData {
    pub as_type: AccelerationStructureType,
    pub buffer: Arc<SoftwareResource>,
    pub offset: u64,
    pub built: Mutex<Option<BuiltStructure>>,
}

impl AccelerationStructureData {
    /// Bytes of the backing buffer available to the structure.
    pub fn capacity(&self) -> u64 {
        self.buffer.width().saturating_sub(self.offset)
    }
}

pub enum ResourceKind {
    Buffer,
    Texture(TextureLayout),
    Sampler(SamplerDesc),
    AccelerationStructure(AccelerationStructureData),
}

struct MemoryBinding {
    memory: Arc<SoftwareMemory>,
    offset: u64,
}

pub struct SoftwareResource {
    base: ResourceBase,
    id: u64,
    kind: ResourceKind,
    binding: Mutex<Option<MemoryBinding>>,
    accounting: Arc<MemoryAccounting>,
}

impl_query_interface!(SoftwareResource);

impl SoftwareResource {
    fn with_kind(base: ResourceBase, id: u64, kind: ResourceKind, accounting: &Arc<MemoryAccounting>) -> Self {
        Self {
            base,
            id,
            kind,
            binding: Mutex::new(None),
            accounting: Arc::clone(accounting),
        }
    }

    pub fn new_buffer(desc: &BufferDesc, id: u64, accounting: &Arc<MemoryAccounting>) -> Result<Arc<Self>> {
        let resource = Self::with_kind(ResourceBase::buffer(desc), id, ResourceKind::Buffer, accounting);
        if let Some(memory_type) = desc.memory_type {
            resource.commit_memory(memory_type)?;
        }
        Ok(Arc::new(resource))
    }

    pub fn new_texture(desc: &TextureDesc, id: u64, accounting: &Arc<MemoryAccounting>) -> Result<Arc<Self>> {
        let resource = Self::with_kind(
            ResourceBase::texture(desc),
            id,
            ResourceKind::Texture(TextureLayout::new(desc)),
            accounting,
        );
        if let Some(memory_type) = desc.memory_type {
            resource.commit_memory(memory_type)?;
        }
        Ok(Arc::new(resource))
    }

    pub fn new_back_buffer(desc: &TextureDesc, id: u64, accounting: &Arc<MemoryAccounting>) -> Result<Arc<Self>> {
        let resource = Self::with_kind(
            ResourceBase::back_buffer(desc),
            id,
            ResourceKind::Texture(TextureLayout::new(desc)),
            accounting,
        );
        resource.allocate(MemoryType::Default)?;
        Ok(Arc::new(resource))
    }

    pub fn new_sampler(desc: &SamplerDesc, id: u64, accounting: &Arc<MemoryAccounting>) -> Arc<Self> {
        Arc::new(Self::with_kind(
            ResourceBase::sampler(),
            id,
            ResourceKind::Sampler(*desc),
            accounting,
        ))
    }

    pub fn new_acceleration_structure(
        as_type: AccelerationStructureType,
        buffer: Arc<Self>,
        offset: u64,
        id: u64,
        accounting: &Arc<MemoryAccounting>,
    ) -> Arc<Self> {
        require!(
            offset % ACCELERATION_STRUCTURE_ALIGNMENT == 0,
            "acceleration structure offset {offset} is not {ACCELERATION_STRUCTURE_ALIGNMENT}-byte aligned"
        );
        let base = ResourceBase::acceleration_structure();
        base.set_memory_type(buffer.memory_type());
        Arc::new(Self::with_kind(
            base,
            id,
            ResourceKind::AccelerationStructure(AccelerationStructureData {
                as_type,
                buffer,
                offset,
                built: Mutex::new(None),
            }),
            accounting,
        ))
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn texture_layout(&self) -> &TextureLayout {
        match &self.kind {
            ResourceKind::Texture(layout) => layout,
            _ => prism_core::contract_violation!("resource {} is not a texture", self.id),
        }
    }

    pub fn acceleration_structure(&self) -> &AccelerationStructureData {
        match &self.kind {
            ResourceKind::AccelerationStructure(data) => data,
            _ => prism_core::contract_violation!("resource {} is not an acceleration structure", self.id),
        }
    }

    /// Bytes of backing memory the resource occupies.
    pub fn byte_size(&self) -> u64 {
        match &self.kind {
            ResourceKind::Buffer => self.base.width,
            ResourceKind::Texture(layout) => layout.size(),
            ResourceKind::Sampler(_) => 0,
            ResourceKind::AccelerationStructure(data) => data.capacity(),
        }
    }

    /// Run `f` over `len` bytes of the resource starting at `offset`.
    pub fn with_bytes<R>(&self, offset: u64, len: u64, f: impl FnOnce(&mut [u8]) -> R) -> R {
        if let ResourceKind::AccelerationStructure(data) = &self.kind {
            return data.buffer.with_bytes(data.offset + offset, len, f);
        }
        require!(
            offset.checked_add(len).is_some_and(|end| end <= self.byte_size()),
            "access of {len} bytes at {offset} overruns resource {} of {} bytes",
            self.id,
            self.byte_size()
        );
        let binding = self.binding.lock();
        let Some(binding) = binding.as_ref() else {
            prism_core::contract_violation!("resource {} is used without bound memory", self.id);
        };
        binding.memory.with_bytes(binding.offset + offset, len, f)
    }

    pub fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        self.with_bytes(offset, len, |bytes| bytes.to_vec())
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        self.with_bytes(offset, data.len() as u64, |bytes| bytes.copy_from_slice(data));
    }

    fn allocate(&self, memory_type: MemoryType) -> Result<()> {
        let memory = SoftwareMemory::allocate(&self.accounting, self.byte_size(), memory_type)?;
        self.attach(memory, 0, memory_type);
        Ok(())
    }

    fn attach(&self, memory: Arc<SoftwareMemory>, offset: u64, memory_type: MemoryType) {
        let mut binding = self.binding.lock();
        require!(binding.is_none(), "resource {} already has memory bound", self.id);
        *binding = Some(MemoryBinding { memory, offset });
        self.base.set_memory_type(memory_type);
    }

    /// Handle of this acceleration structure, derived from its id.
    pub const fn acceleration_structure_handle_value(&self) -> u64 {
        ACCELERATION_STRUCTURE_HANDLE_BASE + self.id * ACCELERATION_STRUCTURE_ALIGNMENT
    }
}

impl Resource for SoftwareResource {
    fn base(&self) -> &ResourceBase {
        &self.base
    }

    fn commit_memory(&self, memory_type: MemoryType) -> Result<()> {
        require!(
            !matches!(self.kind, ResourceKind::Sampler(_) | ResourceKind::AccelerationStructure(_)),
            "only buffers and textures own memory"
        );
        self.allocate(memory_type)
    }

    fn bind_memory(&self, memory: &Arc<dyn Memory>, offset: u64) -> Result<()> {
        let requirements = self.memory_requirements();
        require!(
            offset % requirements.alignment == 0,
            "offset {offset} violates alignment {}",
            requirements.alignment
        );
        require!(
            offset + requirements.size <= memory.size(),
            "placing {} bytes at {offset} overruns a {}-byte memory block",
            requirements.size,
            memory.size()
        );
        let memory_type = memory.memory_type();
        let memory = cast_arc::<SoftwareMemory>(Arc::clone(memory).into_any());
        self.attach(memory, offset, memory_type);
        Ok(())
    }

    fn memory_requirements(&self) -> MemoryRequirements {
        MemoryRequirements {
            size: self.byte_size(),
            alignment: RESOURCE_ALIGNMENT,
            memory_type_bits: MEMORY_TYPE_BITS,
        }
    }

    fn map(&self) -> Result<NonNull<u8>> {
        require!(
            self.memory_type().is_host_visible(),
            "resource {} in {:?} memory cannot be mapped",
            self.id,
            self.memory_type()
        );
        let binding = self.binding.lock();
        let Some(binding) = binding.as_ref() else {
            prism_core::contract_violation!("resource {} is mapped without bound memory", self.id);
        };
        Ok(binding.memory.pointer(binding.offset))
    }

    fn unmap(&self) {}

    fn acceleration_structure_handle(&self) -> u64 {
        match self.kind {
            ResourceKind::AccelerationStructure(_) => self.acceleration_structure_handle_value(),
            _ => 0,
        }
    }

    fn allow_common_state_promotion(&self, state_after: ResourceState) -> bool {
        promotes_from_common(self.resource_type(), state_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::format::Format;
    use prism_core::resource::BindFlag;

    fn accounting() -> Arc<MemoryAccounting> {
        Arc::new(MemoryAccounting::new(1 << 20))
    }

    #[test]
    fn committed_buffer_round_trips_bytes() {
        let buffer = SoftwareResource::new_buffer(
            &BufferDesc::new(64, BindFlag::COPY_SOURCE, MemoryType::Upload),
            1,
            &accounting(),
        )
        .unwrap();
        buffer.update_upload_buffer(8, &[1, 2, 3]).unwrap();
        assert_eq!(buffer.read(8, 3), vec![1, 2, 3]);
        assert!(buffer.update_upload_buffer(62, &[0; 4]).is_err());
    }

    #[test]
    fn placed_buffers_alias_one_block() {
        let accounting = accounting();
        let memory: Arc<dyn Memory> = SoftwareMemory::allocate(&accounting, 1024, MemoryType::Upload).unwrap();
        let first = SoftwareResource::new_buffer(&BufferDesc::placed(256, BindFlag::COPY_SOURCE), 1, &accounting).unwrap();
        let second = SoftwareResource::new_buffer(&BufferDesc::placed(256, BindFlag::COPY_SOURCE), 2, &accounting).unwrap();
        assert!(!first.is_bound());
        first.bind_memory(&memory, 0).unwrap();
        second.bind_memory(&memory, 256).unwrap();
        assert!(first.is_bound());
        assert_eq!(first.memory_type(), MemoryType::Upload);

        second.write(0, &[7]);
        first.with_bytes(0, 1, |bytes| assert_eq!(bytes, &[0]));
        assert_eq!(second.read(0, 1), vec![7]);
    }

    #[test]
    #[should_panic(expected = "cannot be mapped")]
    fn default_memory_is_not_mappable() {
        let buffer = SoftwareResource::new_buffer(
            &BufferDesc::new(16, BindFlag::VERTEX_BUFFER, MemoryType::Default),
            1,
            &accounting(),
        )
        .unwrap();
        let _ = buffer.map();
    }

    #[test]
    fn textures_start_undefined() {
        let texture = SoftwareResource::new_texture(
            &TextureDesc::new_2d(Format::Rgba8Unorm, 4, 4, BindFlag::RENDER_TARGET),
            1,
            &accounting(),
        )
        .unwrap();
        assert_eq!(texture.initial_state(), ResourceState::UNDEFINED);
        assert_eq!(texture.memory_requirements().size, 64);
    }

    #[test]
    fn acceleration_structures_have_distinct_handles() {
        let accounting = accounting();
        let buffer = SoftwareResource::new_buffer(
            &BufferDesc::new(1024, BindFlag::ACCELERATION_STRUCTURE, MemoryType::Default),
            1,
            &accounting,
        )
        .unwrap();
        let blas = SoftwareResource::new_acceleration_structure(
            AccelerationStructureType::BottomLevel,
            Arc::clone(&buffer),
            0,
            2,
            &accounting,
        );
        let tlas = SoftwareResource::new_acceleration_structure(
            AccelerationStructureType::TopLevel,
            buffer,
            512,
            3,
            &accounting,
        );
        assert_ne!(blas.acceleration_structure_handle(), 0);
        assert_ne!(blas.acceleration_structure_handle(), tlas.acceleration_structure_handle());
        assert_eq!(tlas.acceleration_structure().capacity(), 512);
    }
}
