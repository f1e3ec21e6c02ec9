//! The Vulkan device: object factory, capability queries and queues.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use prism_core::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, RaytracingAsPrebuildInfo,
    RaytracingGeometryDesc,
};
use prism_core::binding::{BindingSet, BindingSetLayout, BindingSetLayoutDesc};
use prism_core::command::{CommandList, CommandListType, CommandQueue};
use prism_core::config::DeviceConfig;
use prism_core::device::Device;
use prism_core::fence::Fence;
use prism_core::memory::{Memory, MemoryBudget, MemoryType};
use prism_core::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, Pipeline, RayTracingPipelineDesc, ShaderBlobType,
};
use prism_core::query::{QueryHeap, QueryHeapType};
use prism_core::resource::{BufferDesc, Resource, SamplerDesc, TextureDesc};
use prism_core::swapchain::{Swapchain, SwapchainDesc};
use prism_core::view::{BindlessTypedViewPool, View, ViewDesc, ViewType};
use prism_core::{impl_query_interface, require, Result, RhiError};

use crate::acceleration::{self, Addresses};
use crate::binding::{VulkanBindingSet, VulkanBindingSetLayout};
use crate::capabilities::AdapterCapabilities;
use crate::command_list::VulkanCommandList;
use crate::context::DeviceContext;
use crate::fence::VulkanFence;
use crate::instance::InstanceShared;
use crate::memory::VulkanMemory;
use crate::pipeline::VulkanPipeline;
use crate::query::VulkanQueryHeap;
use crate::queue::VulkanCommandQueue;
use crate::resource::{vulkan_resource, VulkanResource};
use crate::swapchain::VulkanSwapchain;
use crate::view::{VulkanBindlessTypedViewPool, VulkanView};

pub struct VulkanDevice {
    context: Arc<DeviceContext>,
    queues: BTreeMap<CommandListType, Arc<VulkanCommandQueue>>,
}

impl_query_interface!(VulkanDevice);

impl VulkanDevice {
    pub fn new(
        instance: Arc<InstanceShared>,
        physical_device: vk::PhysicalDevice,
        capabilities: AdapterCapabilities,
        config: &DeviceConfig,
    ) -> Result<Self> {
        let context = DeviceContext::new(instance, physical_device, capabilities, config)?;
        let queues = [CommandListType::Graphics, CommandListType::Compute, CommandListType::Copy]
            .into_iter()
            .map(|queue_type| Ok((queue_type, VulkanCommandQueue::new(&context, queue_type)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        tracing::info!(
            graphics = context.queue_families.graphics,
            compute = context.queue_families.compute,
            transfer = context.queue_families.transfer,
            "Vulkan device created"
        );
        Ok(Self { context, queues })
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    pub fn capabilities(&self) -> &AdapterCapabilities {
        self.context.capabilities()
    }

    /// Budget and usage summed over device-local heaps.
    fn heap_budget(&self) -> MemoryBudget {
        let instance = &self.context.instance.instance;
        let mut budget_properties = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
        let mut properties =
            vk::PhysicalDeviceMemoryProperties2::default().push_next(&mut budget_properties);
        unsafe {
            instance.get_physical_device_memory_properties2(self.context.physical_device, &mut properties);
        }
        let memory_properties = properties.memory_properties;
        let heap_count = memory_properties.memory_heap_count as usize;
        let mut budget = MemoryBudget::default();
        for (index, heap) in memory_properties.memory_heaps[..heap_count].iter().enumerate() {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                budget.budget += budget_properties.heap_budget[index];
                budget.usage += budget_properties.heap_usage[index];
            }
        }
        budget
    }

    fn prebuild_or_default(
        &self,
        as_type: AccelerationStructureType,
        geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
        primitive_counts: &[u32],
        flags: BuildAccelerationStructureFlags,
    ) -> RaytracingAsPrebuildInfo {
        acceleration::prebuild_info(&self.context, as_type, geometries, primitive_counts, flags)
            .unwrap_or_else(|e| {
                tracing::warn!(?as_type, "Prebuild info unavailable: {e}");
                RaytracingAsPrebuildInfo::default()
            })
    }
}

impl Device for VulkanDevice {
    fn allocate_memory(
        &self,
        size: u64,
        memory_type: MemoryType,
        memory_type_bits: u32,
    ) -> Result<Arc<dyn Memory>> {
        require!(size > 0, "memory blocks cannot be empty");
        let memory = VulkanMemory::new(&self.context, size, memory_type, memory_type_bits)?;
        Ok(Arc::new(memory))
    }

    fn command_queue(&self, queue_type: CommandListType) -> Arc<dyn CommandQueue> {
        let queue = &self.queues[&queue_type];
        Arc::clone(queue) as Arc<dyn CommandQueue>
    }

    fn texture_data_pitch_alignment(&self) -> u32 {
        u32::try_from(self.context.capabilities.optimal_buffer_copy_row_pitch_alignment)
            .unwrap_or(u32::MAX)
            .max(1)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<Arc<dyn Swapchain>> {
        let swapchain = VulkanSwapchain::new(&self.context, desc)?;
        Ok(swapchain)
    }

    fn create_command_list(&self, list_type: CommandListType) -> Result<Arc<dyn CommandList>> {
        let command_list = VulkanCommandList::new(&self.context, list_type)?;
        Ok(command_list)
    }

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn Fence>> {
        let fence = VulkanFence::new(&self.context, initial_value)?;
        Ok(fence)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Arc<dyn Resource>> {
        require!(
            desc.width > 0 && desc.height > 0 && desc.depth_or_array_layers > 0,
            "texture extent {}x{}x{} is empty",
            desc.width,
            desc.height,
            desc.depth_or_array_layers
        );
        let texture = VulkanResource::new_texture(&self.context, desc)?;
        Ok(texture)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn Resource>> {
        require!(desc.size > 0, "buffers cannot be empty");
        let buffer = VulkanResource::new_buffer(&self.context, desc)?;
        Ok(buffer)
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Arc<dyn Resource>> {
        let sampler = VulkanResource::new_sampler(&self.context, desc)?;
        Ok(sampler)
    }

    fn create_view(&self, resource: &Arc<dyn Resource>, desc: &ViewDesc) -> Result<Arc<dyn View>> {
        let view = VulkanView::new(&self.context, vulkan_resource(resource), desc)?;
        Ok(view)
    }

    fn create_bindless_typed_view_pool(
        &self,
        view_type: ViewType,
        view_count: u32,
    ) -> Result<Arc<dyn BindlessTypedViewPool>> {
        let pool = VulkanBindlessTypedViewPool::new(&self.context, view_type, view_count)?;
        Ok(pool)
    }

    fn create_binding_set_layout(
        &self,
        desc: &BindingSetLayoutDesc,
    ) -> Result<Arc<dyn BindingSetLayout>> {
        let layout = VulkanBindingSetLayout::new(&self.context, desc)?;
        Ok(layout)
    }

    fn create_binding_set(&self, layout: &Arc<dyn BindingSetLayout>) -> Result<Arc<dyn BindingSet>> {
        let set = VulkanBindingSet::new(&self.context, layout)?;
        Ok(set)
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<Arc<dyn Pipeline>> {
        let pipeline = VulkanPipeline::graphics(&self.context, desc)?;
        Ok(pipeline)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<Arc<dyn Pipeline>> {
        let pipeline = VulkanPipeline::compute(&self.context, desc)?;
        Ok(pipeline)
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<Arc<dyn Pipeline>> {
        if !self.context.features.ray_tracing {
            return Err(RhiError::ExtensionNotSupported(
                "VK_KHR_ray_tracing_pipeline".to_string(),
            ));
        }
        let pipeline = VulkanPipeline::ray_tracing(&self.context, desc)?;
        Ok(pipeline)
    }

    fn create_acceleration_structure(
        &self,
        as_type: AccelerationStructureType,
        resource: &Arc<dyn Resource>,
        offset: u64,
    ) -> Result<Arc<dyn Resource>> {
        let structure = VulkanResource::new_acceleration_structure(
            &self.context,
            as_type,
            vulkan_resource(resource),
            offset,
        )?;
        Ok(structure)
    }

    fn create_query_heap(&self, heap_type: QueryHeapType, count: u32) -> Result<Arc<dyn QueryHeap>> {
        require!(count > 0, "query heaps cannot be empty");
        let heap = VulkanQueryHeap::new(&self.context, heap_type, count)?;
        Ok(heap)
    }

    fn wait_idle(&self) -> Result<()> {
        self.context.wait_idle()?;
        for queue in self.queues.values() {
            queue.flush();
        }
        Ok(())
    }

    fn is_dxr_supported(&self) -> bool {
        self.context.features.ray_tracing
    }

    fn is_ray_query_supported(&self) -> bool {
        self.context.features.ray_query
    }

    fn is_variable_rate_shading_supported(&self) -> bool {
        self.context.features.variable_rate_shading
    }

    fn is_mesh_shading_supported(&self) -> bool {
        self.context.features.mesh_shading
    }

    fn is_draw_indirect_count_supported(&self) -> bool {
        self.context.features.draw_indirect_count
    }

    fn is_geometry_shader_supported(&self) -> bool {
        self.context.features.geometry_shader
    }

    fn is_bindless_supported(&self) -> bool {
        self.context.features.bindless
    }

    fn shading_rate_image_tile_size(&self) -> u32 {
        self.context.capabilities.shading_rate_tile_size
    }

    fn memory_budget(&self) -> MemoryBudget {
        if self.context.features.memory_budget {
            return self.heap_budget();
        }
        MemoryBudget {
            budget: self.context.capabilities.device_local_memory_mb * 1024 * 1024,
            usage: self.context.allocated_bytes(),
        }
    }

    fn shader_group_handle_size(&self) -> u32 {
        self.context.capabilities.ray_tracing.shader_group_handle_size
    }

    fn shader_record_alignment(&self) -> u32 {
        self.context.capabilities.ray_tracing.shader_group_handle_alignment
    }

    fn shader_table_alignment(&self) -> u32 {
        self.context.capabilities.ray_tracing.shader_group_base_alignment
    }

    fn supported_shader_blob_type(&self) -> ShaderBlobType {
        ShaderBlobType::Spirv
    }

    fn blas_prebuild_info(
        &self,
        descs: &[RaytracingGeometryDesc],
        flags: BuildAccelerationStructureFlags,
    ) -> RaytracingAsPrebuildInfo {
        let geometries = acceleration::bottom_level_geometries(descs, Addresses::Ignored);
        let primitive_counts: Vec<u32> = descs.iter().map(RaytracingGeometryDesc::primitive_count).collect();
        self.prebuild_or_default(
            AccelerationStructureType::BottomLevel,
            &geometries,
            &primitive_counts,
            flags,
        )
    }

    fn tlas_prebuild_info(
        &self,
        instance_count: u32,
        flags: BuildAccelerationStructureFlags,
    ) -> RaytracingAsPrebuildInfo {
        let geometry = acceleration::top_level_geometry(0);
        self.prebuild_or_default(
            AccelerationStructureType::TopLevel,
            std::slice::from_ref(&geometry),
            &[instance_count],
            flags,
        )
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            tracing::warn!("Vulkan device dropped while the GPU was busy: {e}");
        }
    }
}
