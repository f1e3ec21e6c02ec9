//! The software device: object factory, capability queries and queues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use prism_core::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, RaytracingAsPrebuildInfo,
    RaytracingGeometryDesc,
};
use prism_core::binding::{BindingSet, BindingSetLayout, BindingSetLayoutDesc};
use prism_core::command::{CommandList, CommandListType, CommandQueue};
use prism_core::device::Device;
use prism_core::fence::Fence;
use prism_core::interface::cast_arc;
use prism_core::memory::{Memory, MemoryBudget, MemoryType};
use prism_core::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, Pipeline, RayTracingPipelineDesc, ShaderBlobType,
};
use prism_core::query::{QueryHeap, QueryHeapType};
use prism_core::resource::{BufferDesc, Resource, ResourceType, SamplerDesc, TextureDesc};
use prism_core::swapchain::{Swapchain, SwapchainDesc};
use prism_core::validation::ValidationFilter;
use prism_core::view::{BindlessTypedViewPool, View, ViewDesc, ViewType};
use prism_core::{impl_query_interface, require, Result, RhiError};

use crate::acceleration;
use crate::binding::{SoftwareBindingSet, SoftwareBindingSetLayout};
use crate::command_list::SoftwareCommandList;
use crate::config::SoftwareDeviceConfig;
use crate::context::{DeviceContext, StatsSnapshot};
use crate::fence::SoftwareFence;
use crate::memory::SoftwareMemory;
use crate::pipeline::{
    SoftwarePipeline, SHADER_GROUP_HANDLE_SIZE, SHADER_RECORD_ALIGNMENT, SHADER_TABLE_ALIGNMENT,
};
use crate::query::SoftwareQueryHeap;
use crate::queue::{Scheduler, SoftwareCommandQueue};
use crate::resource::SoftwareResource;
use crate::swapchain::SoftwareSwapchain;
use crate::view::{SoftwareBindlessTypedViewPool, SoftwareView};

/// Row pitch alignment of buffer/texture copy layouts.
const TEXTURE_DATA_PITCH_ALIGNMENT: u32 = 256;
/// Edge length in pixels of one shading-rate image texel.
const SHADING_RATE_TILE_SIZE: u32 = 16;
/// Index of each memory type in `memory_type_bits` masks.
const fn memory_type_bit(memory_type: MemoryType) -> u32 {
    match memory_type {
        MemoryType::Default => 1 << 0,
        MemoryType::Upload => 1 << 1,
        MemoryType::Readback => 1 << 2,
    }
}

pub struct SoftwareDevice {
    context: Arc<DeviceContext>,
    scheduler: Arc<Scheduler>,
    queues: BTreeMap<CommandListType, Arc<SoftwareCommandQueue>>,
}

impl_query_interface!(SoftwareDevice);

fn software_resource(resource: &Arc<dyn Resource>) -> Arc<SoftwareResource> {
    cast_arc::<SoftwareResource>(Arc::clone(resource).into_any())
}

impl SoftwareDevice {
    pub fn new(config: SoftwareDeviceConfig, validation: Arc<ValidationFilter>) -> Self {
        tracing::info!(
            binding_model = ?config.binding_model,
            memory_budget = config.memory_budget,
            "Creating software device"
        );
        let context = DeviceContext::new(config, validation);
        let scheduler = Scheduler::new(Arc::clone(&context));
        let queues = [CommandListType::Graphics, CommandListType::Compute, CommandListType::Copy]
            .into_iter()
            .map(|queue_type| {
                let queue = SoftwareCommandQueue::new(queue_type, Arc::clone(&scheduler));
                (queue_type, Arc::new(queue))
            })
            .collect();
        Self {
            context,
            scheduler,
            queues,
        }
    }

    pub fn config(&self) -> &SoftwareDeviceConfig {
        &self.context.config
    }

    /// Counters of executed work.
    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    pub fn validation(&self) -> &Arc<ValidationFilter> {
        &self.context.validation
    }

    fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.context.config.fence_timeout_ms)
    }
}

impl Device for SoftwareDevice {
    fn allocate_memory(
        &self,
        size: u64,
        memory_type: MemoryType,
        memory_type_bits: u32,
    ) -> Result<Arc<dyn Memory>> {
        if memory_type_bits & memory_type_bit(memory_type) == 0 {
            return Err(RhiError::AllocationFailed(format!(
                "{memory_type:?} memory is not in type mask {memory_type_bits:#b}"
            )));
        }
        let memory = SoftwareMemory::allocate(&self.context.accounting, size, memory_type)?;
        Ok(memory)
    }

    fn command_queue(&self, queue_type: CommandListType) -> Arc<dyn CommandQueue> {
        let queue = &self.queues[&queue_type];
        Arc::clone(queue) as Arc<dyn CommandQueue>
    }

    fn texture_data_pitch_alignment(&self) -> u32 {
        TEXTURE_DATA_PITCH_ALIGNMENT
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<Arc<dyn Swapchain>> {
        let swapchain = SoftwareSwapchain::new(Arc::clone(&self.context), desc)?;
        Ok(Arc::new(swapchain))
    }

    fn create_command_list(&self, list_type: CommandListType) -> Result<Arc<dyn CommandList>> {
        Ok(Arc::new(SoftwareCommandList::new(
            list_type,
            self.context.config.features,
        )))
    }

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn Fence>> {
        Ok(Arc::new(SoftwareFence::new(
            initial_value,
            self.fence_timeout(),
            Arc::downgrade(&self.scheduler),
        )))
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Arc<dyn Resource>> {
        require!(
            desc.width > 0 && desc.height > 0 && desc.depth_or_array_layers > 0,
            "texture extent {}x{}x{} is empty",
            desc.width,
            desc.height,
            desc.depth_or_array_layers
        );
        let texture = SoftwareResource::new_texture(desc, self.context.next_id(), &self.context.accounting)?;
        Ok(texture)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn Resource>> {
        require!(desc.size > 0, "buffers cannot be empty");
        let buffer = SoftwareResource::new_buffer(desc, self.context.next_id(), &self.context.accounting)?;
        Ok(buffer)
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Arc<dyn Resource>> {
        Ok(SoftwareResource::new_sampler(
            desc,
            self.context.next_id(),
            &self.context.accounting,
        ))
    }

    fn create_view(&self, resource: &Arc<dyn Resource>, desc: &ViewDesc) -> Result<Arc<dyn View>> {
        if desc.bindless && !self.context.config.features.bindless {
            return Err(RhiError::ExtensionNotSupported("bindless views".into()));
        }
        let view = SoftwareView::new(software_resource(resource), desc, &self.context.heaps)?;
        Ok(view)
    }

    fn create_bindless_typed_view_pool(
        &self,
        view_type: ViewType,
        view_count: u32,
    ) -> Result<Arc<dyn BindlessTypedViewPool>> {
        if !self.context.config.features.bindless {
            return Err(RhiError::ExtensionNotSupported("bindless view pools".into()));
        }
        let pool = SoftwareBindlessTypedViewPool::new(view_type, view_count, &self.context.heaps)?;
        Ok(pool)
    }

    fn create_binding_set_layout(
        &self,
        desc: &BindingSetLayoutDesc,
    ) -> Result<Arc<dyn BindingSetLayout>> {
        let layout = SoftwareBindingSetLayout::new(desc, &self.context.config.binding_model)?;
        Ok(layout)
    }

    fn create_binding_set(&self, layout: &Arc<dyn BindingSetLayout>) -> Result<Arc<dyn BindingSet>> {
        let layout = cast_arc::<SoftwareBindingSetLayout>(Arc::clone(layout).into_any());
        let set = SoftwareBindingSet::new(layout, &self.context)?;
        Ok(set)
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<Arc<dyn Pipeline>> {
        let pipeline = SoftwarePipeline::graphics(self.context.next_id(), desc)?;
        Ok(pipeline)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<Arc<dyn Pipeline>> {
        let pipeline = SoftwarePipeline::compute(self.context.next_id(), desc)?;
        Ok(pipeline)
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<Arc<dyn Pipeline>> {
        if !self.context.config.features.ray_tracing {
            return Err(RhiError::ExtensionNotSupported("ray tracing pipelines".into()));
        }
        let pipeline = SoftwarePipeline::ray_tracing(self.context.next_id(), desc)?;
        Ok(pipeline)
    }

    fn create_acceleration_structure(
        &self,
        as_type: AccelerationStructureType,
        resource: &Arc<dyn Resource>,
        offset: u64,
    ) -> Result<Arc<dyn Resource>> {
        if !self.context.config.features.ray_tracing {
            return Err(RhiError::ExtensionNotSupported("acceleration structures".into()));
        }
        let buffer = software_resource(resource);
        require!(
            buffer.resource_type() == ResourceType::Buffer,
            "acceleration structures live in buffers, not {:?} resources",
            buffer.resource_type()
        );
        require!(
            offset < buffer.width(),
            "acceleration structure offset {offset} past the end of a {}-byte buffer",
            buffer.width()
        );
        let structure = SoftwareResource::new_acceleration_structure(
            as_type,
            buffer,
            offset,
            self.context.next_id(),
            &self.context.accounting,
        );
        self.context.register_acceleration_structure(&structure);
        Ok(structure)
    }

    fn create_query_heap(&self, heap_type: QueryHeapType, count: u32) -> Result<Arc<dyn QueryHeap>> {
        require!(count > 0, "query heaps cannot be empty");
        Ok(Arc::new(SoftwareQueryHeap::new(heap_type, count)))
    }

    fn wait_idle(&self) -> Result<()> {
        self.scheduler.wait_idle(self.fence_timeout())
    }

    fn is_dxr_supported(&self) -> bool {
        self.context.config.features.ray_tracing
    }

    fn is_ray_query_supported(&self) -> bool {
        self.context.config.features.ray_query
    }

    fn is_variable_rate_shading_supported(&self) -> bool {
        self.context.config.features.variable_rate_shading
    }

    fn is_mesh_shading_supported(&self) -> bool {
        self.context.config.features.mesh_shading
    }

    fn is_draw_indirect_count_supported(&self) -> bool {
        self.context.config.features.draw_indirect_count
    }

    fn is_geometry_shader_supported(&self) -> bool {
        self.context.config.features.geometry_shader
    }

    fn is_bindless_supported(&self) -> bool {
        self.context.config.features.bindless
    }

    fn shading_rate_image_tile_size(&self) -> u32 {
        SHADING_RATE_TILE_SIZE
    }

    fn memory_budget(&self) -> MemoryBudget {
        self.context.accounting.budget()
    }

    fn shader_group_handle_size(&self) -> u32 {
        SHADER_GROUP_HANDLE_SIZE
    }

    fn shader_record_alignment(&self) -> u32 {
        SHADER_RECORD_ALIGNMENT
    }

    fn shader_table_alignment(&self) -> u32 {
        SHADER_TABLE_ALIGNMENT
    }

    fn supported_shader_blob_type(&self) -> ShaderBlobType {
        ShaderBlobType::Spirv
    }

    fn blas_prebuild_info(
        &self,
        descs: &[RaytracingGeometryDesc],
        _flags: BuildAccelerationStructureFlags,
    ) -> RaytracingAsPrebuildInfo {
        acceleration::blas_prebuild_info(acceleration::primitive_count(descs))
    }

    fn tlas_prebuild_info(
        &self,
        instance_count: u32,
        _flags: BuildAccelerationStructureFlags,
    ) -> RaytracingAsPrebuildInfo {
        acceleration::tlas_prebuild_info(u64::from(instance_count))
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        if let Err(e) = self.scheduler.wait_idle(self.fence_timeout()) {
            tracing::warn!("Software device dropped with pending work: {e}");
        }
    }
}
