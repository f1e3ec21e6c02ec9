//! Logical device state shared by every object a device creates.

use std::ffi::{c_char, CStr};
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use prism_core::config::DeviceConfig;
use prism_core::layout::descriptor_set::{DescriptorKind, DescriptorSetLimits};
use prism_core::memory::MemoryType;
use prism_core::validation::ValidationFilter;
use prism_core::{Result, RhiError};

use crate::capabilities::AdapterCapabilities;
use crate::descriptor::{self, BindlessPool};
use crate::error::VulkanError;
use crate::instance::InstanceShared;
use crate::memory::memory_location;

/// Optional features actually enabled on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnabledFeatures {
    pub ray_tracing: bool,
    pub ray_query: bool,
    pub mesh_shading: bool,
    pub variable_rate_shading: bool,
    pub bindless: bool,
    pub inline_uniform_block: bool,
    pub draw_indirect_count: bool,
    pub geometry_shader: bool,
    pub depth_bounds: bool,
    pub sampler_anisotropy: bool,
    pub memory_budget: bool,
}

impl EnabledFeatures {
    /// Intersect the requested features with what the adapter offers.
    pub fn resolve(capabilities: &AdapterCapabilities, config: &DeviceConfig) -> Self {
        let ray_tracing = config.enable_ray_tracing && capabilities.supports_ray_tracing_pipeline;
        Self {
            ray_tracing,
            ray_query: ray_tracing && capabilities.supports_ray_query,
            mesh_shading: config.enable_mesh_shading && capabilities.supports_mesh_shader,
            variable_rate_shading: config.enable_variable_rate_shading
                && capabilities.supports_fragment_shading_rate,
            bindless: capabilities.supports_descriptor_indexing,
            inline_uniform_block: capabilities.supports_inline_uniform_block,
            draw_indirect_count: capabilities.supports_draw_indirect_count,
            geometry_shader: capabilities.supports_geometry_shader,
            depth_bounds: false,
            sampler_anisotropy: false,
            memory_budget: capabilities.supports_memory_budget,
        }
    }

    /// Descriptor kinds served by a device-wide bindless pool.
    pub fn bindless_kinds(&self, capabilities: &AdapterCapabilities) -> Vec<DescriptorKind> {
        if !self.bindless {
            return Vec::new();
        }
        let mut kinds = vec![
            DescriptorKind::Sampler,
            DescriptorKind::SampledImage,
            DescriptorKind::StorageImage,
            DescriptorKind::UniformTexelBuffer,
            DescriptorKind::StorageTexelBuffer,
            DescriptorKind::StorageBuffer,
        ];
        if self.ray_tracing && capabilities.supports_acceleration_structure_update_after_bind {
            kinds.push(DescriptorKind::AccelerationStructure);
        }
        kinds
    }

    pub fn device_extensions(&self) -> Vec<&'static CStr> {
        let mut extensions = vec![ash::khr::swapchain::NAME];
        if self.ray_tracing {
            extensions.extend([
                ash::khr::acceleration_structure::NAME,
                ash::khr::ray_tracing_pipeline::NAME,
                ash::khr::deferred_host_operations::NAME,
            ]);
        }
        if self.ray_query {
            extensions.push(ash::khr::ray_query::NAME);
        }
        if self.mesh_shading {
            extensions.push(ash::ext::mesh_shader::NAME);
        }
        if self.variable_rate_shading {
            extensions.push(ash::khr::fragment_shading_rate::NAME);
        }
        if self.memory_budget {
            extensions.push(ash::ext::memory_budget::NAME);
        }
        extensions
    }
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

/// Find queue families for graphics, compute, and transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics_family = None;
    let mut compute_family = None;
    let mut transfer_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        // Dedicated compute queue (no graphics)
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        // Dedicated transfer queue (no graphics or compute)
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && !family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    let graphics = graphics_family.ok_or(RhiError::NoSuitableAdapter)?;
    let compute = compute_family.unwrap_or(graphics);
    let transfer = transfer_family.unwrap_or(compute);

    Ok(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    })
}

/// A native queue; submissions to it must be externally synchronized.
pub struct QueueSlot {
    pub family: u32,
    pub queue: vk::Queue,
    pub lock: Mutex<()>,
}

pub struct DeviceContext {
    pub(crate) instance: Arc<InstanceShared>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) capabilities: AdapterCapabilities,
    pub(crate) features: EnabledFeatures,
    allocator: Mutex<Option<Allocator>>,

    pub(crate) swapchain_loader: ash::khr::swapchain::Device,
    pub(crate) acceleration_structure_loader: Option<ash::khr::acceleration_structure::Device>,
    pub(crate) ray_tracing_pipeline_loader: Option<ash::khr::ray_tracing_pipeline::Device>,
    pub(crate) mesh_shader_loader: Option<ash::ext::mesh_shader::Device>,
    pub(crate) shading_rate_loader: Option<ash::khr::fragment_shading_rate::Device>,
    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,

    pub(crate) queue_families: QueueFamilyIndices,
    queues: Vec<QueueSlot>,
    pub(crate) descriptor_set_limits: DescriptorSetLimits,
    bindless_pools: Mutex<HashMap<DescriptorKind, Arc<BindlessPool>>>,
    pub(crate) validation: Arc<ValidationFilter>,
}

impl DeviceContext {
    /// Create the logical device, its queues, allocator and bindless pools.
    pub fn new(
        instance: Arc<InstanceShared>,
        physical_device: vk::PhysicalDevice,
        capabilities: AdapterCapabilities,
        config: &DeviceConfig,
    ) -> Result<Arc<Self>> {
        let ash_instance = &instance.instance;
        let queue_families = unsafe { find_queue_families(ash_instance, physical_device) }?;
        let core_features = unsafe { ash_instance.get_physical_device_features(physical_device) };
        let mut features = EnabledFeatures::resolve(&capabilities, config);
        features.depth_bounds = core_features.depth_bounds == vk::TRUE;
        features.sampler_anisotropy = core_features.sampler_anisotropy == vk::TRUE;

        let mut unique_families = vec![
            queue_families.graphics,
            queue_families.compute,
            queue_families.transfer,
        ];
        unique_families.sort_unstable();
        unique_families.dedup();

        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extensions = features.device_extensions();
        let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true)
            .maintenance4(true)
            .inline_uniform_block(features.inline_uniform_block);

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .scalar_block_layout(true)
            .draw_indirect_count(features.draw_indirect_count);
        if features.bindless {
            vulkan_1_2_features = vulkan_1_2_features
                .descriptor_indexing(true)
                .runtime_descriptor_array(true)
                .descriptor_binding_partially_bound(true)
                .descriptor_binding_variable_descriptor_count(true)
                .descriptor_binding_sampled_image_update_after_bind(true)
                .descriptor_binding_storage_image_update_after_bind(true)
                .descriptor_binding_storage_buffer_update_after_bind(true)
                .descriptor_binding_uniform_texel_buffer_update_after_bind(true)
                .descriptor_binding_storage_texel_buffer_update_after_bind(true)
                .shader_sampled_image_array_non_uniform_indexing(true);
        }

        let core = vk::PhysicalDeviceFeatures::default()
            .geometry_shader(features.geometry_shader)
            .depth_bounds(features.depth_bounds)
            .sampler_anisotropy(features.sampler_anisotropy)
            .fill_mode_non_solid(core_features.fill_mode_non_solid == vk::TRUE)
            .multi_draw_indirect(core_features.multi_draw_indirect == vk::TRUE);

        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true)
                .descriptor_binding_acceleration_structure_update_after_bind(
                    capabilities.supports_acceleration_structure_update_after_bind,
                );
        let mut ray_tracing_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);
        let mut mesh_shader_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::default()
            .mesh_shader(true)
            .task_shader(true);
        let mut shading_rate_features = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::default()
            .pipeline_fragment_shading_rate(true)
            .attachment_fragment_shading_rate(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(core)
            .push_next(&mut vulkan_1_3_features)
            .push_next(&mut vulkan_1_2_features);
        if features.ray_tracing {
            features2 = features2
                .push_next(&mut acceleration_structure_features)
                .push_next(&mut ray_tracing_pipeline_features);
        }
        if features.ray_query {
            features2 = features2.push_next(&mut ray_query_features);
        }
        if features.mesh_shading {
            features2 = features2.push_next(&mut mesh_shader_features);
        }
        if features.variable_rate_shading {
            features2 = features2.push_next(&mut shading_rate_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        let device = unsafe { ash_instance.create_device(physical_device, &device_create_info, None) }
            .map_err(VulkanError::from)?;

        let queues = unique_families
            .iter()
            .map(|&family| QueueSlot {
                family,
                queue: unsafe { device.get_device_queue(family, 0) },
                lock: Mutex::new(()),
            })
            .collect();

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ash_instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(VulkanError::from(e).into());
            }
        };

        let bindless_kinds = features.bindless_kinds(&capabilities);
        let descriptor_set_limits = descriptor::descriptor_set_limits(
            &capabilities,
            &bindless_kinds,
            features.inline_uniform_block,
        );

        let swapchain_loader = ash::khr::swapchain::Device::new(ash_instance, &device);
        let acceleration_structure_loader = features
            .ray_tracing
            .then(|| ash::khr::acceleration_structure::Device::new(ash_instance, &device));
        let ray_tracing_pipeline_loader = features
            .ray_tracing
            .then(|| ash::khr::ray_tracing_pipeline::Device::new(ash_instance, &device));
        let mesh_shader_loader = features
            .mesh_shading
            .then(|| ash::ext::mesh_shader::Device::new(ash_instance, &device));
        let shading_rate_loader = features
            .variable_rate_shading
            .then(|| ash::khr::fragment_shading_rate::Device::new(ash_instance, &device));
        let debug_utils = instance
            .debug_utils_enabled
            .then(|| ash::ext::debug_utils::Device::new(ash_instance, &device));

        tracing::info!(
            ray_tracing = features.ray_tracing,
            mesh_shading = features.mesh_shading,
            variable_rate_shading = features.variable_rate_shading,
            bindless = features.bindless,
            "Vulkan device created"
        );

        let context = Arc::new(Self {
            validation: Arc::clone(&instance.validation),
            instance,
            physical_device,
            device,
            capabilities,
            features,
            allocator: Mutex::new(Some(allocator)),
            swapchain_loader,
            acceleration_structure_loader,
            ray_tracing_pipeline_loader,
            mesh_shader_loader,
            shading_rate_loader,
            debug_utils,
            queue_families,
            queues,
            descriptor_set_limits,
            bindless_pools: Mutex::new(HashMap::new()),
        });

        let pools = unsafe {
            descriptor::create_bindless_pools(
                &context.device,
                &context.descriptor_set_limits,
                config.bindless_capacity,
            )
        }?;
        *context.bindless_pools.lock() = pools;
        Ok(context)
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub const fn capabilities(&self) -> &AdapterCapabilities {
        &self.capabilities
    }

    pub const fn features(&self) -> &EnabledFeatures {
        &self.features
    }

    pub fn queue_family(&self, queue_type: prism_core::command::CommandListType) -> u32 {
        use prism_core::command::CommandListType;
        match queue_type {
            CommandListType::Graphics => self.queue_families.graphics,
            CommandListType::Compute => self.queue_families.compute,
            CommandListType::Copy => self.queue_families.transfer,
        }
    }

    pub(crate) fn queue_slot(&self, family: u32) -> &QueueSlot {
        match self.queues.iter().find(|slot| slot.family == family) {
            Some(slot) => slot,
            None => prism_core::contract_violation!("no queue was created for family {family}"),
        }
    }

    /// Pool serving bindless descriptors of `kind`.
    pub(crate) fn bindless_pool(&self, kind: DescriptorKind) -> Result<Arc<BindlessPool>> {
        self.bindless_pools.lock().get(&kind).cloned().ok_or_else(|| {
            RhiError::ExtensionNotSupported(format!("bindless {kind:?} descriptors"))
        })
    }

    /// Allocate memory through gpu-allocator.
    pub(crate) fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        memory_type: MemoryType,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| RhiError::InvalidState("Allocator already shut down".to_string()))?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_location(memory_type),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| VulkanError::from(e).into())
    }

    /// Bytes currently handed out by the allocator.
    pub(crate) fn allocated_bytes(&self) -> u64 {
        self.allocator
            .lock()
            .as_ref()
            .map_or(0, |allocator| allocator.generate_report().total_allocated_bytes)
    }

    pub(crate) fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                tracing::warn!("Failed to free allocation: {e}");
            }
        }
    }

    /// Attach a debug name to a native handle.
    pub(crate) fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            tracing::debug!("Failed to name object: {e}");
        }
    }

    /// Record and synchronously execute a one-shot command buffer on the
    /// graphics queue.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn execute_single_time_commands<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let family = self.queue_families.graphics;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(VulkanError::from)?;
        let result = (|| -> Result<()> {
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = unsafe { self.device.allocate_command_buffers(&allocate_info) }
                .map_err(VulkanError::from)?[0];
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
                .map_err(VulkanError::from)?;
            record(cmd);
            unsafe { self.device.end_command_buffer(cmd) }.map_err(VulkanError::from)?;

            let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
            let submit = vk::SubmitInfo2::default().command_buffer_infos(&command_buffers);
            let slot = self.queue_slot(family);
            let _guard = slot.lock.lock();
            unsafe {
                self.device
                    .queue_submit2(slot.queue, &[submit], vk::Fence::null())
                    .map_err(VulkanError::from)?;
                self.device.queue_wait_idle(slot.queue).map_err(VulkanError::from)?;
            }
            Ok(())
        })();
        unsafe { self.device.destroy_command_pool(pool, None) };
        result
    }

    pub(crate) fn wait_idle(&self) -> Result<()> {
        let _guards: Vec<_> = self.queues.iter().map(|slot| slot.lock.lock()).collect();
        unsafe { self.device.device_wait_idle() }.map_err(VulkanError::from)?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Bindless sets and allocations must go before the device.
            self.bindless_pools.lock().clear();
            self.allocator.lock().take();

            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities() -> AdapterCapabilities {
        AdapterCapabilities {
            vendor: crate::capabilities::GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::make_api_version(0, 1, 3, 0),
            driver_version: 0,
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_timeline_semaphore: true,
            supports_buffer_device_address: true,
            supports_descriptor_indexing: true,
            supports_acceleration_structure_update_after_bind: false,
            supports_inline_uniform_block: true,
            supports_draw_indirect_count: true,
            supports_geometry_shader: true,
            supports_acceleration_structure: true,
            supports_ray_tracing_pipeline: true,
            supports_ray_query: false,
            supports_mesh_shader: false,
            supports_fragment_shading_rate: true,
            supports_memory_budget: true,
            device_local_memory_mb: 4096,
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
            ray_tracing: crate::capabilities::RayTracingLimits::default(),
            available_extensions: std::collections::HashSet::new(),
        }
    }

    #[test]
    fn features_follow_config_and_support() {
        let caps = capabilities();
        let features = EnabledFeatures::resolve(&caps, &DeviceConfig::default());
        assert!(features.ray_tracing);
        assert!(!features.ray_query);
        assert!(!features.mesh_shading);
        assert!(features.variable_rate_shading);

        let features =
            EnabledFeatures::resolve(&caps, &DeviceConfig::default().with_ray_tracing(false));
        assert!(!features.ray_tracing);
        assert!(!features
            .device_extensions()
            .contains(&ash::khr::acceleration_structure::NAME));
    }

    #[test]
    fn acceleration_structures_need_update_after_bind_for_bindless() {
        let caps = capabilities();
        let features = EnabledFeatures::resolve(&caps, &DeviceConfig::default());
        let kinds = features.bindless_kinds(&caps);
        assert!(kinds.contains(&DescriptorKind::SampledImage));
        assert!(!kinds.contains(&DescriptorKind::AccelerationStructure));
        assert!(!kinds.contains(&DescriptorKind::UniformBuffer));
    }

    #[test]
    fn bindless_limits_are_capped() {
        let caps = capabilities();
        let limits = descriptor::descriptor_set_limits(&caps, &[DescriptorKind::SampledImage], true);
        assert_eq!(
            limits.bindless_descriptors(DescriptorKind::SampledImage),
            descriptor::MAX_BINDLESS_DESCRIPTORS
        );
        assert_eq!(limits.max_inline_uniform_block_size, 256);
        let limits = descriptor::descriptor_set_limits(&caps, &[], false);
        assert_eq!(limits.max_inline_uniform_blocks, 0);
    }
}
