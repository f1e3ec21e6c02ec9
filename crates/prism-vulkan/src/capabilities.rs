//! Adapter capability detection.

use std::collections::HashSet;
use std::ffi::CStr;

use ash::vk;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Ray-tracing pipeline limits that size shader tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RayTracingLimits {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Detected adapter capabilities.
#[derive(Debug, Clone)]
pub struct AdapterCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,

    pub supports_dynamic_rendering: bool,
    pub supports_synchronization2: bool,
    pub supports_timeline_semaphore: bool,
    pub supports_buffer_device_address: bool,
    /// Runtime arrays with variable count, partial binding and
    /// update-after-bind for every bindless descriptor kind.
    pub supports_descriptor_indexing: bool,
    pub supports_acceleration_structure_update_after_bind: bool,
    pub supports_inline_uniform_block: bool,
    pub supports_draw_indirect_count: bool,
    pub supports_geometry_shader: bool,
    pub supports_acceleration_structure: bool,
    pub supports_ray_tracing_pipeline: bool,
    pub supports_ray_query: bool,
    pub supports_mesh_shader: bool,
    pub supports_fragment_shading_rate: bool,
    pub supports_memory_budget: bool,

    pub device_local_memory_mb: u64,
    pub optimal_buffer_copy_row_pitch_alignment: u64,
    pub max_inline_uniform_block_size: u32,
    pub max_descriptor_set_inline_uniform_blocks: u32,
    /// Per-stage update-after-bind limits used to size bindless bindings.
    pub max_update_after_bind_samplers: u32,
    pub max_update_after_bind_sampled_images: u32,
    pub max_update_after_bind_storage_images: u32,
    pub max_update_after_bind_storage_buffers: u32,
    pub max_update_after_bind_uniform_buffers: u32,
    pub max_update_after_bind_acceleration_structures: u32,
    pub shading_rate_tile_size: u32,
    pub ray_tracing: RayTracingLimits,

    pub available_extensions: HashSet<String>,
}

impl AdapterCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();
        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();
        let has = |name: &CStr| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        };

        let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
        let mut acceleration_structure = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_tracing_pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
        let mut mesh_shader = vk::PhysicalDeviceMeshShaderFeaturesEXT::default();
        let mut shading_rate = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_1_2)
            .push_next(&mut vulkan_1_3);
        if has(ash::khr::acceleration_structure::NAME) {
            features = features.push_next(&mut acceleration_structure);
        }
        if has(ash::khr::ray_tracing_pipeline::NAME) {
            features = features.push_next(&mut ray_tracing_pipeline);
        }
        if has(ash::khr::ray_query::NAME) {
            features = features.push_next(&mut ray_query);
        }
        if has(ash::ext::mesh_shader::NAME) {
            features = features.push_next(&mut mesh_shader);
        }
        if has(ash::khr::fragment_shading_rate::NAME) {
            features = features.push_next(&mut shading_rate);
        }
        instance.get_physical_device_features2(physical_device, &mut features);
        let core_features = features.features;

        let mut vulkan_1_2_properties = vk::PhysicalDeviceVulkan12Properties::default();
        let mut vulkan_1_3_properties = vk::PhysicalDeviceVulkan13Properties::default();
        let mut ray_tracing_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut acceleration_structure_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut shading_rate_properties =
            vk::PhysicalDeviceFragmentShadingRatePropertiesKHR::default();
        let mut properties = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut vulkan_1_2_properties)
            .push_next(&mut vulkan_1_3_properties);
        if has(ash::khr::ray_tracing_pipeline::NAME) {
            properties = properties.push_next(&mut ray_tracing_properties);
        }
        if has(ash::khr::acceleration_structure::NAME) {
            properties = properties.push_next(&mut acceleration_structure_properties);
        }
        if has(ash::khr::fragment_shading_rate::NAME) {
            properties = properties.push_next(&mut shading_rate_properties);
        }
        instance.get_physical_device_properties2(physical_device, &mut properties);
        let core_properties = properties.properties;
        let limits = core_properties.limits;

        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let supports_acceleration_structure = acceleration_structure.acceleration_structure == vk::TRUE
            && has(ash::khr::deferred_host_operations::NAME);
        let shading_rate_texel = shading_rate_properties.max_fragment_shading_rate_attachment_texel_size;

        Self {
            vendor: GpuVendor::from_vendor_id(core_properties.vendor_id),
            device_name: core_properties
                .device_name_as_c_str()
                .map_or_else(|_| String::from("<unnamed>"), |name| name.to_string_lossy().into_owned()),
            device_type: core_properties.device_type,
            api_version: core_properties.api_version,
            driver_version: core_properties.driver_version,

            supports_dynamic_rendering: vulkan_1_3.dynamic_rendering == vk::TRUE,
            supports_synchronization2: vulkan_1_3.synchronization2 == vk::TRUE,
            supports_timeline_semaphore: vulkan_1_2.timeline_semaphore == vk::TRUE,
            supports_buffer_device_address: vulkan_1_2.buffer_device_address == vk::TRUE,
            supports_descriptor_indexing: vulkan_1_2.descriptor_indexing == vk::TRUE
                && vulkan_1_2.runtime_descriptor_array == vk::TRUE
                && vulkan_1_2.descriptor_binding_variable_descriptor_count == vk::TRUE
                && vulkan_1_2.descriptor_binding_partially_bound == vk::TRUE
                && vulkan_1_2.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
                && vulkan_1_2.descriptor_binding_storage_image_update_after_bind == vk::TRUE
                && vulkan_1_2.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE
                && vulkan_1_2.descriptor_binding_uniform_texel_buffer_update_after_bind == vk::TRUE
                && vulkan_1_2.descriptor_binding_storage_texel_buffer_update_after_bind == vk::TRUE,
            supports_acceleration_structure_update_after_bind: supports_acceleration_structure
                && acceleration_structure.descriptor_binding_acceleration_structure_update_after_bind
                    == vk::TRUE,
            supports_inline_uniform_block: vulkan_1_3.inline_uniform_block == vk::TRUE,
            supports_draw_indirect_count: vulkan_1_2.draw_indirect_count == vk::TRUE,
            supports_geometry_shader: core_features.geometry_shader == vk::TRUE,
            supports_acceleration_structure,
            supports_ray_tracing_pipeline: supports_acceleration_structure
                && ray_tracing_pipeline.ray_tracing_pipeline == vk::TRUE,
            supports_ray_query: supports_acceleration_structure && ray_query.ray_query == vk::TRUE,
            supports_mesh_shader: mesh_shader.mesh_shader == vk::TRUE
                && mesh_shader.task_shader == vk::TRUE,
            supports_fragment_shading_rate: shading_rate.attachment_fragment_shading_rate == vk::TRUE
                && shading_rate.pipeline_fragment_shading_rate == vk::TRUE,
            supports_memory_budget: has(ash::ext::memory_budget::NAME),

            device_local_memory_mb,
            optimal_buffer_copy_row_pitch_alignment: limits.optimal_buffer_copy_row_pitch_alignment,
            max_inline_uniform_block_size: vulkan_1_3_properties.max_inline_uniform_block_size,
            max_descriptor_set_inline_uniform_blocks: vulkan_1_3_properties
                .max_descriptor_set_inline_uniform_blocks,
            max_update_after_bind_samplers: vulkan_1_2_properties
                .max_per_stage_descriptor_update_after_bind_samplers,
            max_update_after_bind_sampled_images: vulkan_1_2_properties
                .max_per_stage_descriptor_update_after_bind_sampled_images,
            max_update_after_bind_storage_images: vulkan_1_2_properties
                .max_per_stage_descriptor_update_after_bind_storage_images,
            max_update_after_bind_storage_buffers: vulkan_1_2_properties
                .max_per_stage_descriptor_update_after_bind_storage_buffers,
            max_update_after_bind_uniform_buffers: vulkan_1_2_properties
                .max_per_stage_descriptor_update_after_bind_uniform_buffers,
            max_update_after_bind_acceleration_structures: acceleration_structure_properties
                .max_per_stage_descriptor_update_after_bind_acceleration_structures,
            shading_rate_tile_size: shading_rate_texel.width.max(shading_rate_texel.height),
            ray_tracing: RayTracingLimits {
                shader_group_handle_size: ray_tracing_properties.shader_group_handle_size,
                shader_group_handle_alignment: ray_tracing_properties.shader_group_handle_alignment,
                shader_group_base_alignment: ray_tracing_properties.shader_group_base_alignment,
                max_ray_recursion_depth: ray_tracing_properties.max_ray_recursion_depth,
            },

            available_extensions,
        }
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .is_ok_and(|name| self.available_extensions.contains(name))
    }

    pub fn has_vulkan_1_3(&self) -> bool {
        vk::api_version_major(self.api_version) > 1
            || (vk::api_version_major(self.api_version) == 1
                && vk::api_version_minor(self.api_version) >= 3)
    }

    /// Check if the adapter meets the minimum requirements of the backend.
    pub fn meets_requirements(&self) -> bool {
        self.has_vulkan_1_3()
            && self.supports_dynamic_rendering
            && self.supports_synchronization2
            && self.supports_timeline_semaphore
            && self.supports_buffer_device_address
    }

    /// Ordering key for adapter selection; higher is better.
    pub fn score(&self) -> i64 {
        let type_score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        let feature_score = [
            self.supports_ray_tracing_pipeline,
            self.supports_mesh_shader,
            self.supports_fragment_shading_rate,
            self.supports_descriptor_indexing,
        ]
        .into_iter()
        .filter(|supported| *supported)
        .count() as i64
            * 10;
        type_score + feature_score + (self.device_local_memory_mb / 1024) as i64
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities() -> AdapterCapabilities {
        AdapterCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "Test GPU".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::make_api_version(0, 1, 3, 250),
            driver_version: 0,
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_timeline_semaphore: true,
            supports_buffer_device_address: true,
            supports_descriptor_indexing: true,
            supports_acceleration_structure_update_after_bind: true,
            supports_inline_uniform_block: true,
            supports_draw_indirect_count: true,
            supports_geometry_shader: true,
            supports_acceleration_structure: true,
            supports_ray_tracing_pipeline: true,
            supports_ray_query: true,
            supports_mesh_shader: false,
            supports_fragment_shading_rate: true,
            supports_memory_budget: true,
            device_local_memory_mb: 8192,
            optimal_buffer_copy_row_pitch_alignment: 1,
            max_inline_uniform_block_size: 256,
            max_descriptor_set_inline_uniform_blocks: 4,
            max_update_after_bind_samplers: 1 << 20,
            max_update_after_bind_sampled_images: 1 << 20,
            max_update_after_bind_storage_images: 1 << 20,
            max_update_after_bind_storage_buffers: 1 << 20,
            max_update_after_bind_uniform_buffers: 15,
            max_update_after_bind_acceleration_structures: 1 << 20,
            shading_rate_tile_size: 16,
            ray_tracing: RayTracingLimits {
                shader_group_handle_size: 32,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
                max_ray_recursion_depth: 31,
            },
            available_extensions: HashSet::from(["VK_KHR_swapchain".to_string()]),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn vulkan_1_2_adapters_are_rejected() {
        let mut caps = capabilities();
        assert!(caps.meets_requirements());
        caps.api_version = vk::make_api_version(0, 1, 2, 0);
        assert!(!caps.meets_requirements());
    }

    #[test]
    fn discrete_adapters_outscore_integrated() {
        let discrete = capabilities();
        let integrated = AdapterCapabilities {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            ..capabilities()
        };
        assert!(discrete.score() > integrated.score());
    }

    #[test]
    fn extension_lookup() {
        let caps = capabilities();
        assert!(caps.has_extension(ash::khr::swapchain::NAME));
        assert!(!caps.has_extension(ash::ext::mesh_shader::NAME));
    }
}
