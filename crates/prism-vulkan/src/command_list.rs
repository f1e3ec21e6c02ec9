//! Command recording into native command buffers.
//!
//! Each command is checked against the same contracts on every backend and
//! recorded straight away. Everything a command touches is retained until
//! the list is reset.

use std::any::Any;
use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use prism_core::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, CopyAccelerationStructureMode,
    RaytracingGeometryDesc,
};
use prism_core::binding::{BindingSet, BindingSetLayout};
use prism_core::command::{
    BufferCopyRegion, BufferToTextureCopyRegion, CommandList, CommandListState, CommandListType,
    DrawIndexedIndirectCommand, DrawIndirectCommand, IndirectCount, RenderPassBeginDesc, ScissorRect,
    ShadingRate, ShadingRateCombiner, TextureCopyRegion, TextureExtent3D, TextureOffset, Viewport,
};
use prism_core::format::Format;
use prism_core::interface::{cast_arc, same_object};
use prism_core::pipeline::{
    Pipeline, PipelineType, RayTracingShaderTable, RayTracingShaderTables, RenderPassLoadOp,
    RenderPassStoreOp,
};
use prism_core::query::{QueryHeap, QueryHeapType, QUERY_RESULT_SIZE};
use prism_core::resource::Resource;
use prism_core::state::{ResourceBarrierDesc, ResourceState};
use prism_core::validation::Severity;
use prism_core::view::View;
use prism_core::{impl_query_interface, require, Result};

use crate::acceleration::{
    acceleration_structure_type, bottom_level_geometries, build_flags, top_level_geometry,
    Addresses,
};
use crate::barrier::{buffer_barrier, image_barrier, image_layout, uav_barrier};
use crate::binding::VulkanBindingSet;
use crate::context::DeviceContext;
use crate::error::VulkanError;
use crate::format::index_type;
use crate::pipeline::VulkanPipeline;
use crate::query::VulkanQueryHeap;
use crate::queue::QueueProgress;
use crate::resource::{vulkan_resource, Native, VulkanResource};
use crate::view::VulkanView;

struct Recording {
    state: CommandListState,
    pipeline: Option<Arc<VulkanPipeline>>,
    binding_set: Option<Arc<VulkanBindingSet>>,
    in_render_pass: bool,
    event_depth: u32,
    retained: Vec<Arc<dyn Any + Send + Sync>>,
}

impl Recording {
    const fn new() -> Self {
        Self {
            state: CommandListState::Recording,
            pipeline: None,
            binding_set: None,
            in_render_pass: false,
            event_depth: 0,
            retained: Vec::new(),
        }
    }

    fn retain<T: Any + Send + Sync>(&mut self, object: &Arc<T>) {
        self.retained.push(Arc::clone(object) as Arc<dyn Any + Send + Sync>);
    }
}

struct Submission {
    progress: Arc<QueueProgress>,
    value: u64,
}

pub struct VulkanCommandList {
    context: Arc<DeviceContext>,
    list_type: CommandListType,
    family: u32,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    recording: Mutex<Recording>,
    submissions: Mutex<Vec<Submission>>,
    name: Mutex<String>,
}

impl_query_interface!(VulkanCommandList);

fn vulkan_view(view: &Arc<dyn View>) -> Arc<VulkanView> {
    cast_arc::<VulkanView>(Arc::clone(view).into_any())
}

fn acceleration_structure(
    resource: &Arc<dyn Resource>,
    as_type: AccelerationStructureType,
) -> Arc<VulkanResource> {
    let resource = vulkan_resource(resource);
    let actual = resource.acceleration_structure().as_type;
    require!(actual == as_type, "expected a {as_type:?} acceleration structure, got {actual:?}");
    resource
}

const fn load_op(op: RenderPassLoadOp) -> vk::AttachmentLoadOp {
    match op {
        RenderPassLoadOp::Load => vk::AttachmentLoadOp::LOAD,
        RenderPassLoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        RenderPassLoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

const fn store_op(op: RenderPassStoreOp) -> vk::AttachmentStoreOp {
    match op {
        RenderPassStoreOp::Store => vk::AttachmentStoreOp::STORE,
        RenderPassStoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

const fn combiner_op(combiner: ShadingRateCombiner) -> vk::FragmentShadingRateCombinerOpKHR {
    match combiner {
        ShadingRateCombiner::Passthrough => vk::FragmentShadingRateCombinerOpKHR::KEEP,
        ShadingRateCombiner::Override => vk::FragmentShadingRateCombinerOpKHR::REPLACE,
        ShadingRateCombiner::Min => vk::FragmentShadingRateCombinerOpKHR::MIN,
        ShadingRateCombiner::Max => vk::FragmentShadingRateCombinerOpKHR::MAX,
        ShadingRateCombiner::Sum => vk::FragmentShadingRateCombinerOpKHR::MUL,
    }
}

fn scissor(rect: &ScissorRect) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: rect.left,
            y: rect.top,
        },
        extent: vk::Extent2D {
            width: u32::try_from(rect.right - rect.left).unwrap_or(0),
            height: u32::try_from(rect.bottom - rect.top).unwrap_or(0),
        },
    }
}

/// Buffer row length in texels; zero means tightly packed.
const fn buffer_row_length(format: Format, row_pitch: u32) -> u32 {
    let block_size = format.block_size();
    if row_pitch == 0 || block_size == 0 {
        0
    } else {
        row_pitch / block_size * format.block_extent()
    }
}

const fn offset_3d(offset: TextureOffset) -> vk::Offset3D {
    vk::Offset3D {
        x: offset.x,
        y: offset.y,
        z: offset.z,
    }
}

const fn extent_3d(extent: TextureExtent3D) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: extent.depth,
    }
}

fn buffer_image_copy(texture: &VulkanResource, region: &BufferToTextureCopyRegion) -> vk::BufferImageCopy {
    let (_, _, aspect_mask) = texture.image();
    vk::BufferImageCopy {
        buffer_offset: region.buffer_offset,
        buffer_row_length: buffer_row_length(texture.format(), region.buffer_row_pitch),
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask,
            mip_level: region.texture_mip_level,
            base_array_layer: region.texture_array_layer,
            layer_count: 1,
        },
        image_offset: offset_3d(region.texture_offset),
        image_extent: extent_3d(region.texture_extent),
    }
}

fn shader_table_region(table: &RayTracingShaderTable) -> vk::StridedDeviceAddressRegionKHR {
    let device_address = table
        .resource
        .as_ref()
        .map_or(0, |resource| vulkan_resource(resource).device_address() + table.offset);
    vk::StridedDeviceAddressRegionKHR {
        device_address,
        stride: table.stride,
        size: table.size,
    }
}

impl VulkanCommandList {
    pub fn new(context: &Arc<DeviceContext>, list_type: CommandListType) -> Result<Arc<Self>> {
        let family = context.queue_family(list_type);
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        let pool = unsafe { context.device.create_command_pool(&pool_info, None) }
            .map_err(VulkanError::from)?;
        let mut list = Self {
            context: Arc::clone(context),
            list_type,
            family,
            pool,
            command_buffer: vk::CommandBuffer::null(),
            recording: Mutex::new(Recording::new()),
            submissions: Mutex::new(Vec::new()),
            name: Mutex::new(String::new()),
        };
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        list.command_buffer = unsafe { context.device.allocate_command_buffers(&allocate_info) }
            .map_err(VulkanError::from)?[0];
        list.begin()?;
        Ok(Arc::new(list))
    }

    fn begin(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe { self.context.device.begin_command_buffer(self.command_buffer, &begin_info) }
            .map_err(VulkanError::from)?;
        Ok(())
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub const fn native(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub const fn family(&self) -> u32 {
        self.family
    }

    pub(crate) fn begin_execution(&self, progress: &Arc<QueueProgress>, value: u64) {
        self.submissions.lock().push(Submission {
            progress: Arc::clone(progress),
            value,
        });
    }

    fn is_executing(&self) -> bool {
        let mut submissions = self.submissions.lock();
        submissions.retain(|submission| !submission.progress.is_complete(submission.value));
        !submissions.is_empty()
    }

    /// Record a command under the recording lock.
    fn record_with(&self, f: impl FnOnce(&mut Recording, vk::CommandBuffer)) {
        let mut recording = self.recording.lock();
        require!(
            recording.state == CommandListState::Recording,
            "command recorded into closed list '{}'",
            self.name()
        );
        f(&mut recording, self.command_buffer);
    }

    fn require_feature(&self, supported: bool, feature: &str) {
        require!(supported, "{feature} is not supported by this device");
    }

    fn require_list_type(&self, allowed: &[CommandListType], operation: &str) {
        require!(
            allowed.contains(&self.list_type),
            "{operation} recorded into a {:?} command list",
            self.list_type
        );
    }

    fn check_draw(recording: &Recording) {
        require!(recording.in_render_pass, "draw recorded outside a render pass");
        let Some(pipeline) = &recording.pipeline else {
            prism_core::contract_violation!("draw recorded without a bound pipeline");
        };
        require!(
            pipeline.pipeline_type() == PipelineType::Graphics,
            "draw recorded with a {:?} pipeline bound",
            pipeline.pipeline_type()
        );
        Self::check_bindings(recording, pipeline);
    }

    fn check_dispatch(recording: &Recording, pipeline_type: PipelineType) {
        require!(!recording.in_render_pass, "dispatch recorded inside a render pass");
        let Some(pipeline) = &recording.pipeline else {
            prism_core::contract_violation!("dispatch recorded without a bound pipeline");
        };
        require!(
            pipeline.pipeline_type() == pipeline_type,
            "{pipeline_type:?} dispatch recorded with a {:?} pipeline bound",
            pipeline.pipeline_type()
        );
        Self::check_bindings(recording, pipeline);
    }

    fn check_bindings(recording: &Recording, pipeline: &Arc<VulkanPipeline>) {
        let desc = pipeline.vulkan_layout().desc();
        let declares_bindings = !desc.bind_keys.is_empty() || !desc.constants.is_empty();
        require!(
            !declares_bindings || recording.binding_set.is_some(),
            "pipeline layout declares bindings but no binding set is bound"
        );
    }

    fn bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: &VulkanPipeline,
        binding_set: &VulkanBindingSet,
    ) {
        let sets = binding_set.descriptor_sets();
        if sets.is_empty() {
            return;
        }
        unsafe {
            self.context.device.cmd_bind_descriptor_sets(
                command_buffer,
                pipeline.bind_point(),
                binding_set.vulkan_layout().pipeline_layout(),
                0,
                &sets,
                &[],
            );
        }
    }

    /// Advance the tracked state of `resource`, reporting subresources that
    /// were not in `state_before`.
    fn track_state(&self, barrier: &ResourceBarrierDesc, resource: &VulkanResource) {
        let mismatches = resource.base().state_tracker().lock().apply(barrier);
        for mismatch in mismatches {
            let promoted = mismatch.actual == ResourceState::COMMON
                && resource.allow_common_state_promotion(barrier.state_before);
            if mismatch.expected == ResourceState::UNDEFINED || promoted {
                continue;
            }
            self.context.validation.report(
                Severity::Error,
                &format!(
                    "barrier on '{}' expects {:?} but subresource (mip {}, layer {}) is in {:?}",
                    resource.base().name(),
                    mismatch.expected,
                    mismatch.mip_level,
                    mismatch.array_layer,
                    mismatch.actual
                ),
            );
        }
    }

    fn record_indirect_draw(
        &self,
        indexed: bool,
        arguments: &Arc<dyn Resource>,
        offset: u64,
        count: Option<&IndirectCount>,
        max_count: u32,
        stride: u32,
    ) {
        let arguments = vulkan_resource(arguments);
        let count = count.map(|count| (vulkan_resource(&count.buffer), count.offset));
        self.record_with(|recording, cmd| {
            Self::check_draw(recording);
            let device = &self.context.device;
            let buffer = arguments.buffer();
            unsafe {
                match (&count, indexed) {
                    (Some((count, count_offset)), false) => device.cmd_draw_indirect_count(
                        cmd,
                        buffer,
                        offset,
                        count.buffer(),
                        *count_offset,
                        max_count,
                        stride,
                    ),
                    (Some((count, count_offset)), true) => device.cmd_draw_indexed_indirect_count(
                        cmd,
                        buffer,
                        offset,
                        count.buffer(),
                        *count_offset,
                        max_count,
                        stride,
                    ),
                    (None, false) => device.cmd_draw_indirect(cmd, buffer, offset, max_count, stride),
                    (None, true) => {
                        device.cmd_draw_indexed_indirect(cmd, buffer, offset, max_count, stride);
                    }
                }
            }
            recording.retain(&arguments);
            if let Some((count, _)) = &count {
                recording.retain(count);
            }
        });
    }
}

impl CommandList for VulkanCommandList {
    fn list_type(&self) -> CommandListType {
        self.list_type
    }

    fn state(&self) -> CommandListState {
        self.recording.lock().state
    }

    fn reset(&self) -> Result<()> {
        require!(
            !self.is_executing(),
            "command list '{}' reset while the GPU is still executing it",
            self.name()
        );
        let mut recording = self.recording.lock();
        unsafe {
            self.context
                .device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .map_err(VulkanError::from)?;
        *recording = Recording::new();
        self.begin()
    }

    fn close(&self) -> Result<()> {
        let mut recording = self.recording.lock();
        if recording.state == CommandListState::Closed {
            return Ok(());
        }
        require!(!recording.in_render_pass, "command list closed inside a render pass");
        require!(
            recording.event_depth == 0,
            "command list closed with {} open debug events",
            recording.event_depth
        );
        unsafe { self.context.device.end_command_buffer(self.command_buffer) }
            .map_err(VulkanError::from)?;
        recording.state = CommandListState::Closed;
        Ok(())
    }

    fn bind_pipeline(&self, pipeline: &Arc<dyn Pipeline>) {
        let pipeline = cast_arc::<VulkanPipeline>(Arc::clone(pipeline).into_any());
        self.record_with(|recording, cmd| {
            if recording.pipeline.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, &pipeline)) {
                return;
            }
            if let Some(set) = &recording.binding_set {
                if !Arc::ptr_eq(set.vulkan_layout(), pipeline.vulkan_layout()) {
                    recording.binding_set = None;
                }
            }
            unsafe {
                self.context
                    .device
                    .cmd_bind_pipeline(cmd, pipeline.bind_point(), pipeline.native());
            }
            // Sets stay bound per bind point; a kept set follows the pipeline.
            if let Some(set) = &recording.binding_set {
                self.bind_descriptor_sets(cmd, &pipeline, set);
            }
            recording.retain(&pipeline);
            recording.pipeline = Some(pipeline);
        });
    }

    fn bind_binding_set(&self, binding_set: &Arc<dyn BindingSet>) {
        let binding_set = cast_arc::<VulkanBindingSet>(Arc::clone(binding_set).into_any());
        self.record_with(|recording, cmd| {
            let Some(pipeline) = &recording.pipeline else {
                prism_core::contract_violation!("binding set bound before any pipeline");
            };
            require!(
                same_object(binding_set.vulkan_layout(), pipeline.vulkan_layout()),
                "binding set layout differs from the bound pipeline's layout"
            );
            let bound = recording.binding_set.as_ref();
            if bound.is_some_and(|bound| Arc::ptr_eq(bound, &binding_set)) {
                return;
            }
            self.bind_descriptor_sets(cmd, pipeline, &binding_set);
            recording.retain(&binding_set);
            recording.binding_set = Some(binding_set);
        });
    }

    fn begin_render_pass(&self, desc: &RenderPassBeginDesc) {
        self.require_list_type(&[CommandListType::Graphics], "render pass");
        require!(
            desc.colors.len() == desc.render_pass.colors.len(),
            "render pass declares {} color attachments but {} views were given",
            desc.render_pass.colors.len(),
            desc.colors.len()
        );
        if desc.shading_rate_image.is_some() {
            self.require_feature(
                self.context.features.variable_rate_shading,
                "variable-rate shading",
            );
        }
        let colors: Vec<Arc<VulkanView>> = desc.colors.iter().map(vulkan_view).collect();
        let depth_stencil = desc.depth_stencil.as_ref().map(vulkan_view);
        let shading_rate_image = desc.shading_rate_image.as_ref().map(vulkan_view);

        self.record_with(|recording, cmd| {
            require!(!recording.in_render_pass, "render pass begun inside another render pass");
            let color_attachments: Vec<vk::RenderingAttachmentInfo> = colors
                .iter()
                .zip(&desc.render_pass.colors)
                .enumerate()
                .map(|(index, (view, pass))| {
                    let color = desc.clear.colors.get(index).copied().unwrap_or([0.0; 4]);
                    vk::RenderingAttachmentInfo::default()
                        .image_view(view.image_view())
                        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                        .load_op(load_op(pass.load_op))
                        .store_op(store_op(pass.store_op))
                        .clear_value(vk::ClearValue {
                            color: vk::ClearColorValue { float32: color },
                        })
                })
                .collect();

            let depth_clear = vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: desc.clear.depth,
                    stencil: u32::from(desc.clear.stencil),
                },
            };
            let pass_depth = &desc.render_pass.depth_stencil;
            let depth_attachment = depth_stencil.as_ref().map(|view| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(view.image_view())
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(load_op(pass_depth.depth_load_op))
                    .store_op(store_op(pass_depth.depth_store_op))
                    .clear_value(depth_clear)
            });
            let stencil_attachment = depth_stencil
                .as_ref()
                .filter(|view| view.vulkan_resource().format().has_stencil())
                .map(|view| {
                    vk::RenderingAttachmentInfo::default()
                        .image_view(view.image_view())
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(load_op(pass_depth.stencil_load_op))
                        .store_op(store_op(pass_depth.stencil_store_op))
                        .clear_value(depth_clear)
                });

            let tile_size = self.context.capabilities.shading_rate_tile_size.max(1);
            let mut shading_rate_info = vk::RenderingFragmentShadingRateAttachmentInfoKHR::default();
            let mut rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: vk::Extent2D {
                        width: desc.width,
                        height: desc.height,
                    },
                })
                .layer_count(desc.layers.max(1))
                .color_attachments(&color_attachments);
            if let Some(attachment) = &depth_attachment {
                rendering_info = rendering_info.depth_attachment(attachment);
            }
            if let Some(attachment) = &stencil_attachment {
                rendering_info = rendering_info.stencil_attachment(attachment);
            }
            if let Some(view) = &shading_rate_image {
                shading_rate_info = shading_rate_info
                    .image_view(view.image_view())
                    .image_layout(vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR)
                    .shading_rate_attachment_texel_size(vk::Extent2D {
                        width: tile_size,
                        height: tile_size,
                    });
                rendering_info = rendering_info.push_next(&mut shading_rate_info);
            }
            unsafe { self.context.device.cmd_begin_rendering(cmd, &rendering_info) };

            for view in colors.iter().chain(&depth_stencil).chain(&shading_rate_image) {
                recording.retain(view);
            }
            recording.in_render_pass = true;
        });
    }

    fn end_render_pass(&self) {
        self.record_with(|recording, cmd| {
            require!(recording.in_render_pass, "render pass ended without being begun");
            unsafe { self.context.device.cmd_end_rendering(cmd) };
            recording.in_render_pass = false;
        });
    }

    fn begin_event(&self, name: &str) {
        self.record_with(|recording, cmd| {
            recording.event_depth += 1;
            if let Some(debug_utils) = &self.context.debug_utils {
                let name = CString::new(name).unwrap_or_default();
                let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
                unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &label) };
            }
        });
    }

    fn end_event(&self) {
        self.record_with(|recording, cmd| {
            require!(recording.event_depth > 0, "debug event ended without being begun");
            recording.event_depth -= 1;
            if let Some(debug_utils) = &self.context.debug_utils {
                unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
            }
        });
    }

    fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.record_with(|recording, cmd| {
            Self::check_draw(recording);
            unsafe {
                self.context
                    .device
                    .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
            }
        });
    }

    fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record_with(|recording, cmd| {
            Self::check_draw(recording);
            unsafe {
                self.context.device.cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                );
            }
        });
    }

    fn draw_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64) {
        let stride = std::mem::size_of::<DrawIndirectCommand>() as u32;
        self.record_indirect_draw(false, argument_buffer, argument_buffer_offset, None, 1, stride);
    }

    fn draw_indexed_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64) {
        let stride = std::mem::size_of::<DrawIndexedIndirectCommand>() as u32;
        self.record_indirect_draw(true, argument_buffer, argument_buffer_offset, None, 1, stride);
    }

    fn draw_indirect_count(
        &self,
        argument_buffer: &Arc<dyn Resource>,
        argument_buffer_offset: u64,
        count: Option<&IndirectCount>,
        max_draw_count: u32,
        stride: u32,
    ) {
        if count.is_some() {
            self.require_feature(self.context.features.draw_indirect_count, "draw-indirect-count");
        }
        self.record_indirect_draw(
            false,
            argument_buffer,
            argument_buffer_offset,
            count,
            max_draw_count,
            stride,
        );
    }

    fn draw_indexed_indirect_count(
        &self,
        argument_buffer: &Arc<dyn Resource>,
        argument_buffer_offset: u64,
        count: Option<&IndirectCount>,
        max_draw_count: u32,
        stride: u32,
    ) {
        if count.is_some() {
            self.require_feature(self.context.features.draw_indirect_count, "draw-indirect-count");
        }
        self.record_indirect_draw(
            true,
            argument_buffer,
            argument_buffer_offset,
            count,
            max_draw_count,
            stride,
        );
    }

    fn dispatch(&self, thread_group_count_x: u32, thread_group_count_y: u32, thread_group_count_z: u32) {
        self.require_list_type(&[CommandListType::Graphics, CommandListType::Compute], "dispatch");
        self.record_with(|recording, cmd| {
            Self::check_dispatch(recording, PipelineType::Compute);
            unsafe {
                self.context.device.cmd_dispatch(
                    cmd,
                    thread_group_count_x,
                    thread_group_count_y,
                    thread_group_count_z,
                );
            }
        });
    }

    fn dispatch_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64) {
        self.require_list_type(&[CommandListType::Graphics, CommandListType::Compute], "dispatch");
        let arguments = vulkan_resource(argument_buffer);
        self.record_with(|recording, cmd| {
            Self::check_dispatch(recording, PipelineType::Compute);
            unsafe {
                self.context
                    .device
                    .cmd_dispatch_indirect(cmd, arguments.buffer(), argument_buffer_offset);
            }
            recording.retain(&arguments);
        });
    }

    fn dispatch_mesh(&self, thread_group_count_x: u32, thread_group_count_y: u32, thread_group_count_z: u32) {
        self.require_feature(self.context.features.mesh_shading, "mesh shading");
        self.record_with(|recording, cmd| {
            Self::check_draw(recording);
            if let Some(loader) = &self.context.mesh_shader_loader {
                unsafe {
                    loader.cmd_draw_mesh_tasks(
                        cmd,
                        thread_group_count_x,
                        thread_group_count_y,
                        thread_group_count_z,
                    );
                }
            }
        });
    }

    fn dispatch_rays(&self, shader_tables: &RayTracingShaderTables, width: u32, height: u32, depth: u32) {
        self.require_feature(self.context.features.ray_tracing, "ray tracing");
        self.require_list_type(
            &[CommandListType::Graphics, CommandListType::Compute],
            "dispatch_rays",
        );
        let mut raygen = shader_table_region(&shader_tables.raygen);
        // The ray-generation region holds exactly one record.
        raygen.stride = raygen.size;
        let miss = shader_table_region(&shader_tables.miss);
        let hit = shader_table_region(&shader_tables.hit);
        let callable = shader_table_region(&shader_tables.callable);
        let tables: Vec<Arc<VulkanResource>> = [
            &shader_tables.raygen,
            &shader_tables.miss,
            &shader_tables.hit,
            &shader_tables.callable,
        ]
        .iter()
        .filter_map(|table| table.resource.as_ref().map(vulkan_resource))
        .collect();
        self.record_with(|recording, cmd| {
            Self::check_dispatch(recording, PipelineType::RayTracing);
            if let Some(loader) = &self.context.ray_tracing_pipeline_loader {
                unsafe {
                    loader.cmd_trace_rays(cmd, &raygen, &miss, &hit, &callable, width, height, depth);
                }
            }
            for table in &tables {
                recording.retain(table);
            }
        });
    }

    fn resource_barrier(&self, barriers: &[ResourceBarrierDesc]) {
        let resources: Vec<Arc<VulkanResource>> = barriers
            .iter()
            .map(|barrier| vulkan_resource(&barrier.resource))
            .collect();
        if barriers.iter().all(ResourceBarrierDesc::is_elided) {
            return;
        }
        self.record_with(|recording, cmd| {
            let mut image_barriers = Vec::new();
            let mut memory_barriers = Vec::new();
            for (barrier, resource) in barriers.iter().zip(&resources) {
                if barrier.is_elided() {
                    continue;
                }
                self.track_state(barrier, resource);
                match resource.native() {
                    Native::Image { .. } => {
                        let (image, _, aspect) = resource.image();
                        image_barriers.extend(image_barrier(barrier, image, aspect));
                    }
                    _ => {
                        if memory_barriers.is_empty() {
                            memory_barriers.push(buffer_barrier());
                        }
                    }
                }
                recording.retain(resource);
            }
            if image_barriers.is_empty() && memory_barriers.is_empty() {
                return;
            }
            let dependency = vk::DependencyInfo::default()
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .memory_barriers(&memory_barriers)
                .image_memory_barriers(&image_barriers);
            unsafe { self.context.device.cmd_pipeline_barrier2(cmd, &dependency) };
        });
    }

    fn uav_resource_barrier(&self, resource: Option<&Arc<dyn Resource>>) {
        let resource = resource.map(vulkan_resource);
        self.record_with(|recording, cmd| {
            let barriers = [uav_barrier()];
            let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
            unsafe { self.context.device.cmd_pipeline_barrier2(cmd, &dependency) };
            if let Some(resource) = &resource {
                recording.retain(resource);
            }
        });
    }

    fn set_viewport(&self, viewport: &Viewport) {
        require!(
            viewport.width > 0.0 && viewport.height > 0.0,
            "viewport of {}x{} is empty",
            viewport.width,
            viewport.height
        );
        let native = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        self.record_with(|_, cmd| unsafe {
            self.context.device.cmd_set_viewport(cmd, 0, &[native]);
        });
    }

    fn set_scissor_rect(&self, rect: &ScissorRect) {
        let native = scissor(rect);
        self.record_with(|_, cmd| unsafe {
            self.context.device.cmd_set_scissor(cmd, 0, &[native]);
        });
    }

    fn ia_set_index_buffer(&self, resource: &Arc<dyn Resource>, offset: u64, format: Format) {
        require!(
            matches!(format, Format::R16Uint | Format::R32Uint),
            "{format:?} is not an index format"
        );
        let resource = vulkan_resource(resource);
        self.record_with(|recording, cmd| {
            unsafe {
                self.context.device.cmd_bind_index_buffer(
                    cmd,
                    resource.buffer(),
                    offset,
                    index_type(format),
                );
            }
            recording.retain(&resource);
        });
    }

    fn ia_set_vertex_buffer(&self, slot: u32, resource: &Arc<dyn Resource>, offset: u64) {
        let resource = vulkan_resource(resource);
        self.record_with(|recording, cmd| {
            unsafe {
                self.context
                    .device
                    .cmd_bind_vertex_buffers(cmd, slot, &[resource.buffer()], &[offset]);
            }
            recording.retain(&resource);
        });
    }

    fn rs_set_shading_rate(&self, shading_rate: ShadingRate, combiners: [ShadingRateCombiner; 2]) {
        self.require_feature(
            self.context.features.variable_rate_shading,
            "variable-rate shading",
        );
        let (width, height) = shading_rate.fragment_size();
        let fragment_size = vk::Extent2D { width, height };
        let ops = combiners.map(combiner_op);
        self.record_with(|_, cmd| {
            if let Some(loader) = &self.context.shading_rate_loader {
                unsafe { (loader.fp().cmd_set_fragment_shading_rate_khr)(cmd, &fragment_size, &ops) };
            }
        });
    }

    fn set_depth_bounds(&self, min_depth_bounds: f32, max_depth_bounds: f32) {
        require!(
            min_depth_bounds <= max_depth_bounds,
            "depth bounds {min_depth_bounds}..{max_depth_bounds} are inverted"
        );
        self.record_with(|_, cmd| {
            if self.context.features.depth_bounds {
                unsafe {
                    self.context
                        .device
                        .cmd_set_depth_bounds(cmd, min_depth_bounds, max_depth_bounds);
                }
            } else {
                tracing::debug!("Depth bounds ignored; the device has no depth-bounds test");
            }
        });
    }

    fn set_stencil_reference(&self, stencil_reference: u32) {
        self.record_with(|_, cmd| unsafe {
            self.context.device.cmd_set_stencil_reference(
                cmd,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                stencil_reference,
            );
        });
    }

    fn set_blend_constants(&self, constants: [f32; 4]) {
        self.record_with(|_, cmd| unsafe {
            self.context.device.cmd_set_blend_constants(cmd, &constants);
        });
    }

    fn build_bottom_level_as(
        &self,
        src: Option<&Arc<dyn Resource>>,
        dst: &Arc<dyn Resource>,
        scratch: &Arc<dyn Resource>,
        scratch_offset: u64,
        descs: &[RaytracingGeometryDesc],
        flags: BuildAccelerationStructureFlags,
    ) {
        self.require_feature(self.context.features.ray_tracing, "ray tracing");
        self.require_list_type(
            &[CommandListType::Graphics, CommandListType::Compute],
            "acceleration-structure build",
        );
        let src = src.map(|src| acceleration_structure(src, AccelerationStructureType::BottomLevel));
        let dst = acceleration_structure(dst, AccelerationStructureType::BottomLevel);
        let scratch = vulkan_resource(scratch);
        let geometries = bottom_level_geometries(descs, Addresses::Resolved);
        let ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = descs
            .iter()
            .map(|desc| vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: desc.primitive_count(),
                ..Default::default()
            })
            .collect();
        let geometry_buffers: Vec<Arc<VulkanResource>> = descs
            .iter()
            .flat_map(|desc| [&desc.vertex.resource, &desc.index.resource])
            .filter_map(|resource| resource.as_ref().map(vulkan_resource))
            .collect();

        self.record_with(|recording, cmd| {
            let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(acceleration_structure_type(AccelerationStructureType::BottomLevel))
                .flags(build_flags(flags))
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .dst_acceleration_structure(dst.acceleration_structure().handle)
                .geometries(&geometries)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch.device_address() + scratch_offset,
                });
            if let Some(src) = &src {
                build_info = build_info
                    .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                    .src_acceleration_structure(src.acceleration_structure().handle);
                recording.retain(src);
            }
            if let Some(loader) = &self.context.acceleration_structure_loader {
                unsafe {
                    loader.cmd_build_acceleration_structures(cmd, &[build_info], &[ranges.as_slice()]);
                }
            }
            recording.retain(&dst);
            recording.retain(&scratch);
            for buffer in &geometry_buffers {
                recording.retain(buffer);
            }
        });
    }

    fn build_top_level_as(
        &self,
        src: Option<&Arc<dyn Resource>>,
        dst: &Arc<dyn Resource>,
        scratch: &Arc<dyn Resource>,
        scratch_offset: u64,
        instance_data: &Arc<dyn Resource>,
        instance_offset: u64,
        instance_count: u32,
        flags: BuildAccelerationStructureFlags,
    ) {
        self.require_feature(self.context.features.ray_tracing, "ray tracing");
        self.require_list_type(
            &[CommandListType::Graphics, CommandListType::Compute],
            "acceleration-structure build",
        );
        let src = src.map(|src| acceleration_structure(src, AccelerationStructureType::TopLevel));
        let dst = acceleration_structure(dst, AccelerationStructureType::TopLevel);
        let scratch = vulkan_resource(scratch);
        let instances = vulkan_resource(instance_data);
        let geometries = [top_level_geometry(instances.device_address() + instance_offset)];
        let ranges = [vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instance_count,
            ..Default::default()
        }];

        self.record_with(|recording, cmd| {
            let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(acceleration_structure_type(AccelerationStructureType::TopLevel))
                .flags(build_flags(flags))
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .dst_acceleration_structure(dst.acceleration_structure().handle)
                .geometries(&geometries)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch.device_address() + scratch_offset,
                });
            if let Some(src) = &src {
                build_info = build_info
                    .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                    .src_acceleration_structure(src.acceleration_structure().handle);
                recording.retain(src);
            }
            if let Some(loader) = &self.context.acceleration_structure_loader {
                unsafe {
                    loader.cmd_build_acceleration_structures(cmd, &[build_info], &[ranges.as_slice()]);
                }
            }
            recording.retain(&dst);
            recording.retain(&scratch);
            recording.retain(&instances);
        });
    }

    fn copy_acceleration_structure(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        mode: CopyAccelerationStructureMode,
    ) {
        self.require_feature(self.context.features.ray_tracing, "ray tracing");
        let src = vulkan_resource(src);
        let dst = vulkan_resource(dst);
        let src_type = src.acceleration_structure().as_type;
        let dst_type = dst.acceleration_structure().as_type;
        require!(
            src_type == dst_type,
            "acceleration structure copy from {src_type:?} to {dst_type:?}"
        );
        let mode = match mode {
            CopyAccelerationStructureMode::Clone => vk::CopyAccelerationStructureModeKHR::CLONE,
            CopyAccelerationStructureMode::Compact => vk::CopyAccelerationStructureModeKHR::COMPACT,
        };
        self.record_with(|recording, cmd| {
            let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
                .src(src.acceleration_structure().handle)
                .dst(dst.acceleration_structure().handle)
                .mode(mode);
            if let Some(loader) = &self.context.acceleration_structure_loader {
                unsafe { loader.cmd_copy_acceleration_structure(cmd, &copy_info) };
            }
            recording.retain(&src);
            recording.retain(&dst);
        });
    }

    fn copy_buffer(&self, src: &Arc<dyn Resource>, dst: &Arc<dyn Resource>, regions: &[BufferCopyRegion]) {
        let src = vulkan_resource(src);
        let dst = vulkan_resource(dst);
        let regions: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|region| vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.num_bytes,
            })
            .collect();
        self.record_with(|recording, cmd| {
            if !regions.is_empty() {
                unsafe {
                    self.context
                        .device
                        .cmd_copy_buffer(cmd, src.buffer(), dst.buffer(), &regions);
                }
            }
            recording.retain(&src);
            recording.retain(&dst);
        });
    }

    fn copy_buffer_to_texture(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[BufferToTextureCopyRegion],
    ) {
        let src = vulkan_resource(src);
        let dst = vulkan_resource(dst);
        let regions: Vec<vk::BufferImageCopy> =
            regions.iter().map(|region| buffer_image_copy(&dst, region)).collect();
        self.record_with(|recording, cmd| {
            let (image, _, _) = dst.image();
            if !regions.is_empty() {
                unsafe {
                    self.context.device.cmd_copy_buffer_to_image(
                        cmd,
                        src.buffer(),
                        image,
                        image_layout(ResourceState::COPY_DEST),
                        &regions,
                    );
                }
            }
            recording.retain(&src);
            recording.retain(&dst);
        });
    }

    fn copy_texture_to_buffer(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[BufferToTextureCopyRegion],
    ) {
        let src = vulkan_resource(src);
        let dst = vulkan_resource(dst);
        let regions: Vec<vk::BufferImageCopy> =
            regions.iter().map(|region| buffer_image_copy(&src, region)).collect();
        self.record_with(|recording, cmd| {
            let (image, _, _) = src.image();
            if !regions.is_empty() {
                unsafe {
                    self.context.device.cmd_copy_image_to_buffer(
                        cmd,
                        image,
                        image_layout(ResourceState::COPY_SOURCE),
                        dst.buffer(),
                        &regions,
                    );
                }
            }
            recording.retain(&src);
            recording.retain(&dst);
        });
    }

    fn copy_texture(&self, src: &Arc<dyn Resource>, dst: &Arc<dyn Resource>, regions: &[TextureCopyRegion]) {
        let src = vulkan_resource(src);
        let dst = vulkan_resource(dst);
        let (src_image, _, src_aspect) = src.image();
        let (dst_image, _, dst_aspect) = dst.image();
        let regions: Vec<vk::ImageCopy> = regions
            .iter()
            .map(|region| vk::ImageCopy {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: src_aspect,
                    mip_level: region.src_mip_level,
                    base_array_layer: region.src_array_layer,
                    layer_count: 1,
                },
                src_offset: offset_3d(region.src_offset),
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: dst_aspect,
                    mip_level: region.dst_mip_level,
                    base_array_layer: region.dst_array_layer,
                    layer_count: 1,
                },
                dst_offset: offset_3d(region.dst_offset),
                extent: extent_3d(region.extent),
            })
            .collect();
        self.record_with(|recording, cmd| {
            if !regions.is_empty() {
                unsafe {
                    self.context.device.cmd_copy_image(
                        cmd,
                        src_image,
                        image_layout(ResourceState::COPY_SOURCE),
                        dst_image,
                        image_layout(ResourceState::COPY_DEST),
                        &regions,
                    );
                }
            }
            recording.retain(&src);
            recording.retain(&dst);
        });
    }

    fn write_acceleration_structures_properties(
        &self,
        acceleration_structures: &[Arc<dyn Resource>],
        query_heap: &Arc<dyn QueryHeap>,
        first_query: u32,
    ) {
        self.require_feature(self.context.features.ray_tracing, "ray tracing");
        require!(
            query_heap.heap_type() == QueryHeapType::AccelerationStructureCompactedSize,
            "compacted sizes written into a {:?} heap",
            query_heap.heap_type()
        );
        let query_count = acceleration_structures.len() as u32;
        require!(
            first_query
                .checked_add(query_count)
                .is_some_and(|end| end <= query_heap.count()),
            "{query_count} queries from {first_query} overrun a heap of {}",
            query_heap.count()
        );
        let heap = cast_arc::<VulkanQueryHeap>(Arc::clone(query_heap).into_any());
        let structures: Vec<Arc<VulkanResource>> =
            acceleration_structures.iter().map(vulkan_resource).collect();
        let handles: Vec<vk::AccelerationStructureKHR> = structures
            .iter()
            .map(|resource| resource.acceleration_structure().handle)
            .collect();
        self.record_with(|recording, cmd| {
            if query_count == 0 {
                return;
            }
            unsafe {
                self.context
                    .device
                    .cmd_reset_query_pool(cmd, heap.native(), first_query, query_count);
            }
            if let Some(loader) = &self.context.acceleration_structure_loader {
                unsafe {
                    loader.cmd_write_acceleration_structures_properties(
                        cmd,
                        &handles,
                        heap.query_type(),
                        heap.native(),
                        first_query,
                    );
                }
            }
            recording.retain(&heap);
            for structure in &structures {
                recording.retain(structure);
            }
        });
    }

    fn resolve_query_data(
        &self,
        query_heap: &Arc<dyn QueryHeap>,
        first_query: u32,
        query_count: u32,
        dst_buffer: &Arc<dyn Resource>,
        dst_offset: u64,
    ) {
        require!(
            first_query
                .checked_add(query_count)
                .is_some_and(|end| end <= query_heap.count()),
            "{query_count} queries from {first_query} overrun a heap of {}",
            query_heap.count()
        );
        let heap = cast_arc::<VulkanQueryHeap>(Arc::clone(query_heap).into_any());
        let dst = vulkan_resource(dst_buffer);
        self.record_with(|recording, cmd| {
            unsafe {
                self.context.device.cmd_copy_query_pool_results(
                    cmd,
                    heap.native(),
                    first_query,
                    query_count,
                    dst.buffer(),
                    dst_offset,
                    QUERY_RESULT_SIZE,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                );
            }
            recording.retain(&heap);
            recording.retain(&dst);
        });
    }

    fn set_name(&self, name: &str) {
        name.clone_into(&mut *self.name.lock());
        self.context.set_object_name(self.command_buffer, name);
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        for submission in self.submissions.get_mut().drain(..) {
            if !submission.progress.is_complete(submission.value) {
                submission.progress.wait(submission.value);
            }
        }
        unsafe { self.context.device.destroy_command_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_ops() {
        assert_eq!(load_op(RenderPassLoadOp::Clear), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(load_op(RenderPassLoadOp::Load), vk::AttachmentLoadOp::LOAD);
        assert_eq!(store_op(RenderPassStoreOp::DontCare), vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn combiners() {
        assert_eq!(
            combiner_op(ShadingRateCombiner::Passthrough),
            vk::FragmentShadingRateCombinerOpKHR::KEEP
        );
        assert_eq!(
            combiner_op(ShadingRateCombiner::Override),
            vk::FragmentShadingRateCombinerOpKHR::REPLACE
        );
    }

    #[test]
    fn inverted_scissor_is_empty() {
        let rect = scissor(&ScissorRect {
            left: 10,
            top: 10,
            right: 5,
            bottom: 30,
        });
        assert_eq!(rect.extent.width, 0);
        assert_eq!(rect.extent.height, 20);
        assert_eq!(rect.offset.x, 10);
    }

    #[test]
    fn row_length_is_in_texels() {
        assert_eq!(buffer_row_length(Format::Rgba8Unorm, 0), 0);
        assert_eq!(buffer_row_length(Format::Rgba8Unorm, 256), 64);
        // 8-byte 4x4 blocks: 32 blocks per row cover 128 texels.
        assert_eq!(buffer_row_length(Format::Bc1RgbaUnorm, 256), 128);
    }
}
