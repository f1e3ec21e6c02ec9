//! Instances, adapters and the device factory.

use std::sync::Arc;

use crate::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, RaytracingAsPrebuildInfo,
    RaytracingGeometryDesc,
};
use crate::binding::{BindingSet, BindingSetLayout, BindingSetLayoutDesc};
use crate::command::{CommandList, CommandListType, CommandQueue};
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::fence::Fence;
use crate::interface::QueryInterface;
use crate::memory::{Memory, MemoryBudget, MemoryType};
use crate::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, Pipeline, RayTracingPipelineDesc, ShaderBlobType,
};
use crate::query::{QueryHeap, QueryHeapType};
use crate::resource::{BufferDesc, Resource, SamplerDesc, TextureDesc};
use crate::swapchain::{Swapchain, SwapchainDesc};
use crate::validation::ValidationFilter;
use crate::view::{BindlessTypedViewPool, View, ViewDesc, ViewType};

/// Native API a backend drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiType {
    Vulkan,
    Software,
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vulkan => f.write_str("vulkan"),
            Self::Software => f.write_str("software"),
        }
    }
}

impl std::str::FromStr for ApiType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => Ok(Self::Vulkan),
            "software" | "sw" => Ok(Self::Software),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Entry point of a backend.
pub trait Instance: QueryInterface {
    fn api_type(&self) -> ApiType;

    /// Adapters ordered by preference, best first.
    fn enumerate_adapters(&self) -> Result<Vec<Arc<dyn Adapter>>>;

    /// Sink for validation and debug-layer messages of every device.
    fn validation(&self) -> Arc<ValidationFilter>;
}

/// One physical GPU.
pub trait Adapter: QueryInterface {
    fn name(&self) -> String;
    fn create_device(&self, config: &DeviceConfig) -> Result<Arc<dyn Device>>;
}

/// Factory for every other object, plus capability queries.
pub trait Device: QueryInterface {
    fn allocate_memory(
        &self,
        size: u64,
        memory_type: MemoryType,
        memory_type_bits: u32,
    ) -> Result<Arc<dyn Memory>>;
    fn command_queue(&self, queue_type: CommandListType) -> Arc<dyn CommandQueue>;
    fn texture_data_pitch_alignment(&self) -> u32;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<Arc<dyn Swapchain>>;
    fn create_command_list(&self, list_type: CommandListType) -> Result<Arc<dyn CommandList>>;
    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn Fence>>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<Arc<dyn Resource>>;
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn Resource>>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Arc<dyn Resource>>;
    fn create_view(&self, resource: &Arc<dyn Resource>, desc: &ViewDesc) -> Result<Arc<dyn View>>;
    fn create_bindless_typed_view_pool(
        &self,
        view_type: ViewType,
        view_count: u32,
    ) -> Result<Arc<dyn BindlessTypedViewPool>>;
    fn create_binding_set_layout(
        &self,
        desc: &BindingSetLayoutDesc,
    ) -> Result<Arc<dyn BindingSetLayout>>;
    fn create_binding_set(&self, layout: &Arc<dyn BindingSetLayout>) -> Result<Arc<dyn BindingSet>>;
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<Arc<dyn Pipeline>>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<Arc<dyn Pipeline>>;
    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<Arc<dyn Pipeline>>;

    /// Place an acceleration structure at `offset` inside `resource`, which
    /// must be a buffer sized from the matching prebuild info.
    fn create_acceleration_structure(
        &self,
        as_type: AccelerationStructureType,
        resource: &Arc<dyn Resource>,
        offset: u64,
    ) -> Result<Arc<dyn Resource>>;
    fn create_query_heap(&self, heap_type: QueryHeapType, count: u32) -> Result<Arc<dyn QueryHeap>>;

    /// Block until every queue is idle.
    fn wait_idle(&self) -> Result<()>;

    fn is_dxr_supported(&self) -> bool;
    fn is_ray_query_supported(&self) -> bool;
    fn is_variable_rate_shading_supported(&self) -> bool;
    fn is_mesh_shading_supported(&self) -> bool;
    fn is_draw_indirect_count_supported(&self) -> bool;
    fn is_geometry_shader_supported(&self) -> bool;
    fn is_bindless_supported(&self) -> bool;

    fn shading_rate_image_tile_size(&self) -> u32;
    fn memory_budget(&self) -> MemoryBudget;
    fn shader_group_handle_size(&self) -> u32;
    fn shader_record_alignment(&self) -> u32;
    fn shader_table_alignment(&self) -> u32;
    fn supported_shader_blob_type(&self) -> ShaderBlobType;

    fn blas_prebuild_info(
        &self,
        descs: &[RaytracingGeometryDesc],
        flags: BuildAccelerationStructureFlags,
    ) -> RaytracingAsPrebuildInfo;
    fn tlas_prebuild_info(
        &self,
        instance_count: u32,
        flags: BuildAccelerationStructureFlags,
    ) -> RaytracingAsPrebuildInfo;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_type_parses_aliases() {
        assert_eq!("Vulkan".parse::<ApiType>(), Ok(ApiType::Vulkan));
        assert_eq!("sw".parse::<ApiType>(), Ok(ApiType::Software));
        assert!("metal".parse::<ApiType>().is_err());
        assert_eq!(ApiType::Software.to_string(), "software");
    }
}
