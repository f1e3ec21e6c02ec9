//! Headless software backend for the Prism render hardware interface.
//!
//! This crate provides:
//! - A device whose resources live in host memory under an enforced budget
//! - Command recording with contract checks and CPU replay of clears, copies
//!   and acceleration-structure builds
//! - Per-subresource state validation reported through the validation filter
//! - Both binding models (root tables and descriptor sets), selectable per
//!   device, so layouts can be exercised without a GPU
//! - Timeline fences and queues that honor cross-queue waits

pub mod acceleration;
pub mod binding;
pub mod command_list;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
mod execute;
pub mod fence;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod resource;
pub mod swapchain;
pub mod texel;
pub mod view;

pub use config::{BindingModel, SoftwareDeviceConfig, SoftwareFeatures};
pub use context::StatsSnapshot;
pub use device::SoftwareDevice;
pub use instance::{SoftwareAdapter, SoftwareInstance};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use prism_core::acceleration::{
        AccelerationStructureType, BuildAccelerationStructureFlags, CopyAccelerationStructureMode,
        GeometryBuffer, RaytracingGeometryDesc, RaytracingGeometryInstance,
    };
    use prism_core::command::{
        BufferToTextureCopyRegion, CommandList, CommandListType, RenderPassBeginDesc, TextureExtent3D,
        Viewport,
    };
    use prism_core::config::ValidationFilterConfig;
    use prism_core::device::Device;
    use prism_core::format::Format;
    use prism_core::interface::cast_arc;
    use prism_core::memory::MemoryType;
    use prism_core::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, RenderPassDesc, ShaderBlob};
    use prism_core::query::QueryHeapType;
    use prism_core::resource::{BindFlag, BufferDesc, Resource, TextureDesc};
    use prism_core::state::{ResourceBarrierDesc, ResourceState};
    use prism_core::validation::ValidationFilter;
    use prism_core::view::{ViewDesc, ViewDimension, ViewType};
    use prism_core::{BindingSetLayoutDesc, RhiError, ShaderType};

    use super::*;
    use crate::resource::SoftwareResource;

    fn device_with(config: SoftwareDeviceConfig) -> SoftwareDevice {
        SoftwareDevice::new(
            config,
            Arc::new(ValidationFilter::new(ValidationFilterConfig::default())),
        )
    }

    fn device() -> SoftwareDevice {
        device_with(SoftwareDeviceConfig::default().with_fence_timeout_ms(200))
    }

    fn buffer(device: &SoftwareDevice, size: u64, usage: BindFlag, memory_type: MemoryType) -> Arc<dyn Resource> {
        device.create_buffer(&BufferDesc::new(size, usage, memory_type)).unwrap()
    }

    fn submit(device: &SoftwareDevice, list: &Arc<dyn CommandList>) {
        list.close().unwrap();
        let queue = device.command_queue(list.list_type());
        queue.execute_command_lists(std::slice::from_ref(list)).unwrap();
    }

    fn bytes_of(resource: &Arc<dyn Resource>, offset: u64, len: u64) -> Vec<u8> {
        cast_arc::<SoftwareResource>(Arc::clone(resource).into_any()).read(offset, len)
    }

    #[test]
    fn fence_signal_and_wait() {
        let device = device();
        let fence = device.create_fence(0).unwrap();
        fence.signal(5).unwrap();
        assert_eq!(fence.completed_value(), 5);
        fence.wait(3).unwrap();
        assert!(matches!(fence.wait(6), Err(RhiError::Timeout(_))));
    }

    #[test]
    fn queue_wait_stalls_until_cpu_signal() {
        let device = device();
        let gate = device.create_fence(0).unwrap();
        let done = device.create_fence(0).unwrap();
        let queue = device.command_queue(CommandListType::Graphics);
        let list = device.create_command_list(CommandListType::Graphics).unwrap();
        list.set_blend_constants([1.0; 4]);
        list.close().unwrap();

        queue.wait(&gate, 1).unwrap();
        queue.execute_command_lists(&[Arc::clone(&list)]).unwrap();
        queue.signal(&done, 1).unwrap();
        assert_eq!(done.completed_value(), 0);
        assert_eq!(device.stats().submissions, 0);

        gate.signal(1).unwrap();
        done.wait(1).unwrap();
        assert_eq!(device.stats().submissions, 1);
        device.wait_idle().unwrap();
    }

    #[test]
    fn wait_idle_reports_a_never_signaled_wait() {
        let device = device();
        let gate = device.create_fence(0).unwrap();
        device.command_queue(CommandListType::Compute).wait(&gate, 1).unwrap();
        assert!(matches!(device.wait_idle(), Err(RhiError::InvalidState(_))));
        gate.signal(1).unwrap();
        device.wait_idle().unwrap();
    }

    #[test]
    fn same_state_barriers_are_not_transitions() {
        let device = device();
        let buffer = buffer(&device, 256, BindFlag::UNORDERED_ACCESS, MemoryType::Default);
        let list = device.create_command_list(CommandListType::Compute).unwrap();
        let uav = ResourceState::UNORDERED_ACCESS;
        list.resource_barrier(&[
            ResourceBarrierDesc::new(&buffer, ResourceState::COMMON, uav),
            ResourceBarrierDesc::new(&buffer, uav, uav),
        ]);
        submit(&device, &list);
        assert_eq!(device.stats().transitions, 1);
        assert_eq!(device.validation().error_count(), 0);
    }

    #[test]
    fn barrier_from_wrong_state_is_reported() {
        let device = device();
        let texture = device
            .create_texture(
                &TextureDesc::new_2d(Format::Rgba8Unorm, 4, 4, BindFlag::RENDER_TARGET)
                    .with_memory_type(Some(MemoryType::Default)),
            )
            .unwrap();
        let list = device.create_command_list(CommandListType::Graphics).unwrap();
        list.resource_barrier(&[ResourceBarrierDesc::new(
            &texture,
            ResourceState::PIXEL_SHADER_RESOURCE,
            ResourceState::RENDER_TARGET,
        )]);
        submit(&device, &list);
        assert_eq!(device.validation().error_count(), 1);
        let state = texture.base().state_tracker().lock().subresource_state(0, 0);
        assert_eq!(state, ResourceState::RENDER_TARGET);
    }

    #[test]
    fn device_exposes_its_config() {
        let device = device();
        assert_eq!(device.config().fence_timeout_ms, 200);
        assert_eq!(device.config().binding_model, BindingModel::default());
    }

    #[test]
    fn out_of_range_dynamic_state_is_reported() {
        let device = device();
        let list = device.create_command_list(CommandListType::Graphics).unwrap();
        list.set_depth_bounds(0.25, 0.75);
        list.set_stencil_reference(0xff);
        list.set_blend_constants([0.0, 0.5, 1.0, 1.0]);
        submit(&device, &list);
        assert_eq!(device.validation().error_count(), 0);

        let list = device.create_command_list(CommandListType::Graphics).unwrap();
        list.set_depth_bounds(0.5, 2.0);
        list.set_stencil_reference(0x100);
        list.set_blend_constants([f32::NAN, 0.0, 0.0, 1.0]);
        submit(&device, &list);
        assert_eq!(device.validation().error_count(), 3);
    }

    #[test]
    fn clear_writes_the_render_target() {
        let device = device();
        let texture = device
            .create_texture(
                &TextureDesc::new_2d(Format::Bgra8Unorm, 8, 8, BindFlag::RENDER_TARGET)
                    .with_memory_type(Some(MemoryType::Default)),
            )
            .unwrap();
        let view = device
            .create_view(&texture, &ViewDesc::new(ViewType::RenderTarget, ViewDimension::Texture2D))
            .unwrap();
        let list = device.create_command_list(CommandListType::Graphics).unwrap();
        list.resource_barrier(&[ResourceBarrierDesc::new(
            &texture,
            ResourceState::UNDEFINED,
            ResourceState::RENDER_TARGET,
        )]);
        list.begin_render_pass(&RenderPassBeginDesc::clear_color(
            &view,
            Format::Bgra8Unorm,
            8,
            8,
            [0.0, 0.2, 0.4, 1.0],
        ));
        list.end_render_pass();
        submit(&device, &list);

        assert_eq!(device.validation().error_count(), 0);
        assert_eq!(device.stats().clears, 1);
        assert_eq!(bytes_of(&texture, 0, 4), [102, 51, 0, 255]);
        assert_eq!(bytes_of(&texture, 63 * 4, 4), [102, 51, 0, 255]);
    }

    #[test]
    fn buffer_texture_copies_honor_row_pitch() {
        let device = device();
        let texture = device
            .create_texture(
                &TextureDesc::new_2d(Format::R8Unorm, 4, 2, BindFlag::empty())
                    .with_memory_type(Some(MemoryType::Default)),
            )
            .unwrap();
        let upload = buffer(&device, 512, BindFlag::COPY_SOURCE, MemoryType::Upload);
        let readback = buffer(&device, 512, BindFlag::COPY_DEST, MemoryType::Readback);
        upload.update_upload_buffer(0, &[1, 2, 3, 4]).unwrap();
        upload.update_upload_buffer(256, &[5, 6, 7, 8]).unwrap();

        let region = BufferToTextureCopyRegion {
            buffer_row_pitch: 256,
            texture_extent: TextureExtent3D {
                width: 4,
                height: 2,
                depth: 1,
            },
            ..BufferToTextureCopyRegion::default()
        };
        let list = device.create_command_list(CommandListType::Copy).unwrap();
        list.resource_barrier(&[ResourceBarrierDesc::new(
            &texture,
            ResourceState::UNDEFINED,
            ResourceState::COPY_DEST,
        )]);
        list.copy_buffer_to_texture(&upload, &texture, &[region]);
        list.resource_barrier(&[ResourceBarrierDesc::new(
            &texture,
            ResourceState::COPY_DEST,
            ResourceState::COPY_SOURCE,
        )]);
        list.copy_texture_to_buffer(&texture, &readback, &[region]);
        submit(&device, &list);

        assert_eq!(device.validation().error_count(), 0);
        assert_eq!(bytes_of(&texture, 0, 8), [1, 2, 3, 4, 5, 6, 7, 8]);
        let mut row = [0; 4];
        readback.read_readback_buffer(256, &mut row).unwrap();
        assert_eq!(row, [5, 6, 7, 8]);
    }

    #[test]
    fn unaligned_row_pitch_is_reported() {
        let device = device();
        let texture = device
            .create_texture(
                &TextureDesc::new_2d(Format::R8Unorm, 4, 2, BindFlag::empty())
                    .with_memory_type(Some(MemoryType::Default)),
            )
            .unwrap();
        let upload = buffer(&device, 512, BindFlag::COPY_SOURCE, MemoryType::Upload);
        let region = BufferToTextureCopyRegion {
            buffer_row_pitch: 4,
            texture_extent: TextureExtent3D {
                width: 4,
                height: 2,
                depth: 1,
            },
            ..BufferToTextureCopyRegion::default()
        };
        let list = device.create_command_list(CommandListType::Copy).unwrap();
        list.resource_barrier(&[ResourceBarrierDesc::new(
            &texture,
            ResourceState::UNDEFINED,
            ResourceState::COPY_DEST,
        )]);
        list.copy_buffer_to_texture(&upload, &texture, &[region]);
        submit(&device, &list);
        assert_eq!(device.validation().error_count(), 1);
        assert_eq!(device.stats().copies, 0);
    }

    #[test]
    fn indirect_count_without_buffer_runs_max_count() {
        let device = device();
        let layout = device.create_binding_set_layout(&BindingSetLayoutDesc::default()).unwrap();
        let pipeline = device
            .create_compute_pipeline(&ComputePipelineDesc {
                shader: ShaderBlob::new(ShaderType::Compute, "main", &[1, 2, 3, 4]),
                layout: Arc::clone(&layout),
            })
            .unwrap();
        let graphics = device
            .create_graphics_pipeline(&GraphicsPipelineDesc::new(
                vec![
                    ShaderBlob::new(ShaderType::Vertex, "main", &[1]),
                    ShaderBlob::new(ShaderType::Pixel, "main", &[1]),
                ],
                &layout,
                RenderPassDesc::default(),
            ))
            .unwrap();
        let arguments = buffer(&device, 256, BindFlag::INDIRECT_BUFFER, MemoryType::Upload);
        let commands: [u32; 12] = [3, 1, 0, 0, 3, 1, 0, 0, 3, 1, 0, 0];
        arguments.update_upload_buffer(0, bytemuck::cast_slice(&commands)).unwrap();

        let list = device.create_command_list(CommandListType::Graphics).unwrap();
        list.bind_pipeline(&graphics);
        list.begin_render_pass(&RenderPassBeginDesc::default());
        list.set_viewport(&Viewport::new(8.0, 8.0));
        list.draw_indirect_count(&arguments, 0, None, 3, 16);
        list.end_render_pass();
        list.bind_pipeline(&pipeline);
        list.dispatch(1, 1, 1);
        submit(&device, &list);

        assert_eq!(device.validation().error_count(), 0);
        assert_eq!(device.stats().draws, 3);
        assert_eq!(device.stats().dispatches, 1);
    }

    #[test]
    fn bottom_level_build_compaction_and_instancing() {
        let device = device();
        let vertices: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let vertex_buffer = buffer(&device, 36, BindFlag::SHADER_RESOURCE, MemoryType::Upload);
        vertex_buffer.update_upload_buffer(0, bytemuck::cast_slice(&vertices)).unwrap();
        let geometry = RaytracingGeometryDesc {
            vertex: GeometryBuffer::new(&vertex_buffer, Format::Rgb32Float, 3),
            ..RaytracingGeometryDesc::default()
        };
        let flags = BuildAccelerationStructureFlags::ALLOW_COMPACTION;
        let info = device.blas_prebuild_info(std::slice::from_ref(&geometry), flags);

        let as_usage = BindFlag::ACCELERATION_STRUCTURE;
        let blas_buffer = buffer(&device, info.acceleration_structure_size, as_usage, MemoryType::Default);
        let scratch = buffer(
            &device,
            info.build_scratch_data_size,
            BindFlag::UNORDERED_ACCESS,
            MemoryType::Default,
        );
        let blas = device
            .create_acceleration_structure(AccelerationStructureType::BottomLevel, &blas_buffer, 0)
            .unwrap();
        let heap = device
            .create_query_heap(QueryHeapType::AccelerationStructureCompactedSize, 1)
            .unwrap();
        let readback = buffer(&device, 8, BindFlag::COPY_DEST, MemoryType::Readback);

        let list = device.create_command_list(CommandListType::Compute).unwrap();
        list.build_bottom_level_as(None, &blas, &scratch, 0, &[geometry], flags);
        list.uav_resource_barrier(Some(&blas));
        list.write_acceleration_structures_properties(&[Arc::clone(&blas)], &heap, 0);
        list.resolve_query_data(&heap, 0, 1, &readback, 0);
        submit(&device, &list);
        let fence = device.create_fence(0).unwrap();
        device.command_queue(CommandListType::Compute).signal(&fence, 1).unwrap();
        fence.wait(1).unwrap();

        let mut compacted = [0; 8];
        readback.read_readback_buffer(0, &mut compacted).unwrap();
        let compacted = u64::from_le_bytes(compacted);
        assert!(compacted > 0 && compacted <= info.acceleration_structure_size);
        assert_eq!(&bytes_of(&blas, 0, 4), b"PRSM");

        let compact_buffer = buffer(&device, compacted, as_usage, MemoryType::Default);
        let compact = device
            .create_acceleration_structure(AccelerationStructureType::BottomLevel, &compact_buffer, 0)
            .unwrap();
        let instance = RaytracingGeometryInstance::new(compact.acceleration_structure_handle());
        let instances = buffer(&device, 64, BindFlag::SHADER_RESOURCE, MemoryType::Upload);
        instances.update_upload_buffer(0, bytemuck::bytes_of(&instance)).unwrap();
        let tlas_info = device.tlas_prebuild_info(1, BuildAccelerationStructureFlags::empty());
        let tlas_buffer = buffer(&device, tlas_info.acceleration_structure_size, as_usage, MemoryType::Default);
        let tlas = device
            .create_acceleration_structure(AccelerationStructureType::TopLevel, &tlas_buffer, 0)
            .unwrap();
        let tlas_scratch = buffer(
            &device,
            tlas_info.build_scratch_data_size,
            BindFlag::UNORDERED_ACCESS,
            MemoryType::Default,
        );

        let list = device.create_command_list(CommandListType::Compute).unwrap();
        list.copy_acceleration_structure(&blas, &compact, CopyAccelerationStructureMode::Compact);
        list.uav_resource_barrier(None);
        list.build_top_level_as(
            None,
            &tlas,
            &tlas_scratch,
            0,
            &instances,
            0,
            1,
            BuildAccelerationStructureFlags::empty(),
        );
        submit(&device, &list);
        device.wait_idle().unwrap();

        assert_eq!(device.validation().error_count(), 0);
        assert_eq!(device.stats().builds, 2);
    }

    #[test]
    fn instance_of_unbuilt_structure_is_reported() {
        let device = device();
        let as_usage = BindFlag::ACCELERATION_STRUCTURE;
        let blas_buffer = buffer(&device, 512, as_usage, MemoryType::Default);
        let blas = device
            .create_acceleration_structure(AccelerationStructureType::BottomLevel, &blas_buffer, 0)
            .unwrap();
        let instance = RaytracingGeometryInstance::new(blas.acceleration_structure_handle());
        let instances = buffer(&device, 64, BindFlag::SHADER_RESOURCE, MemoryType::Upload);
        instances.update_upload_buffer(0, bytemuck::bytes_of(&instance)).unwrap();
        let tlas_buffer = buffer(&device, 512, as_usage, MemoryType::Default);
        let tlas = device
            .create_acceleration_structure(AccelerationStructureType::TopLevel, &tlas_buffer, 0)
            .unwrap();
        let scratch = buffer(&device, 512, BindFlag::UNORDERED_ACCESS, MemoryType::Default);

        let list = device.create_command_list(CommandListType::Compute).unwrap();
        let flags = BuildAccelerationStructureFlags::empty();
        list.build_top_level_as(None, &tlas, &scratch, 0, &instances, 0, 1, flags);
        submit(&device, &list);
        device.wait_idle().unwrap();

        assert_eq!(device.validation().error_count(), 1);
        assert_eq!(device.stats().builds, 0);
    }

    #[test]
    fn memory_budget_tracks_committed_resources() {
        let device = device_with(SoftwareDeviceConfig::default().with_memory_budget(4096));
        let first = buffer(&device, 2048, BindFlag::empty(), MemoryType::Default);
        assert_eq!(device.memory_budget().usage, 2048);
        let result = device.create_buffer(&BufferDesc::new(4096, BindFlag::empty(), MemoryType::Default));
        assert!(matches!(result, Err(RhiError::AllocationFailed(_))));
        drop(first);
        assert_eq!(device.memory_budget().usage, 0);
        assert_eq!(device.memory_budget().budget, 4096);
    }
}
