//! Command recording.
//!
//! Recording validates caller contracts and captures shared references to
//! everything a command touches; [`crate::execute`] replays the stream when
//! a queue runs the list.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, CopyAccelerationStructureMode,
    GeometryBuffer, RaytracingGeometryDesc, RaytracingGeometryInstance,
};
use prism_core::binding::{BindingSet, BindingSetLayout};
use prism_core::command::{
    BufferCopyRegion, BufferToTextureCopyRegion, ClearDesc, CommandList, CommandListState,
    CommandListType, DispatchIndirectCommand, DrawIndexedIndirectCommand, DrawIndirectCommand, IndirectCount,
    RenderPassBeginDesc, ScissorRect, ShadingRate, ShadingRateCombiner, TextureCopyRegion,
    Viewport,
};
use prism_core::format::Format;
use prism_core::interface::{cast_arc, same_object};
use prism_core::pipeline::{
    Pipeline, PipelineType, RayTracingShaderTable, RayTracingShaderTables, RenderPassDesc,
};
use prism_core::query::{QueryHeap, QueryHeapType};
use prism_core::resource::Resource;
use prism_core::state::ResourceBarrierDesc;
use prism_core::view::View;
use prism_core::{impl_query_interface, require, Result};

use crate::binding::SoftwareBindingSet;
use crate::config::SoftwareFeatures;
use crate::context::DeviceContext;
use crate::execute::Executor;
use crate::pipeline::SoftwarePipeline;
use crate::query::SoftwareQueryHeap;
use crate::resource::SoftwareResource;
use crate::view::SoftwareView;

pub(crate) struct RenderPassBegin {
    pub render_pass: RenderPassDesc,
    pub colors: Vec<Arc<SoftwareView>>,
    pub depth_stencil: Option<Arc<SoftwareView>>,
    pub shading_rate_image: Option<Arc<SoftwareView>>,
    pub clear: ClearDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndirectKind {
    Draw,
    DrawIndexed,
    Dispatch,
}

impl IndirectKind {
    pub const fn command_size(self) -> u64 {
        match self {
            Self::Draw => std::mem::size_of::<DrawIndirectCommand>() as u64,
            Self::DrawIndexed => std::mem::size_of::<DrawIndexedIndirectCommand>() as u64,
            Self::Dispatch => std::mem::size_of::<DispatchIndirectCommand>() as u64,
        }
    }
}

/// A buffer range referenced by a command.
#[derive(Clone)]
pub(crate) struct BufferRange {
    pub resource: Arc<SoftwareResource>,
    pub offset: u64,
    pub size: u64,
}

pub(crate) struct GeometryRef {
    pub vertex: Option<BufferRange>,
    pub index: Option<BufferRange>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DynamicState {
    ShadingRate(ShadingRate, [ShadingRateCombiner; 2]),
    DepthBounds(f32, f32),
    StencilReference(u32),
    BlendConstants([f32; 4]),
}

pub(crate) enum Command {
    BindPipeline(Arc<SoftwarePipeline>),
    BindBindingSet(Arc<SoftwareBindingSet>),
    BeginRenderPass(RenderPassBegin),
    EndRenderPass,
    BeginEvent(String),
    EndEvent,
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
    },
    Indirect {
        kind: IndirectKind,
        arguments: Arc<SoftwareResource>,
        offset: u64,
        count: Option<(Arc<SoftwareResource>, u64)>,
        max_count: u32,
        stride: u64,
    },
    Dispatch {
        groups: [u32; 3],
        mesh: bool,
    },
    DispatchRays {
        tables: [Option<BufferRange>; 4],
        strides: [u64; 4],
        size: [u32; 3],
    },
    Barriers(Vec<ResourceBarrierDesc>),
    UavBarrier,
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    SetIndexBuffer {
        resource: Arc<SoftwareResource>,
        offset: u64,
        format: Format,
    },
    SetVertexBuffer {
        slot: u32,
        resource: Arc<SoftwareResource>,
        offset: u64,
    },
    SetDynamicState(DynamicState),
    BuildBottomLevel {
        src: Option<Arc<SoftwareResource>>,
        dst: Arc<SoftwareResource>,
        scratch: Arc<SoftwareResource>,
        scratch_offset: u64,
        geometries: Vec<GeometryRef>,
        primitive_count: u64,
        flags: BuildAccelerationStructureFlags,
    },
    BuildTopLevel {
        src: Option<Arc<SoftwareResource>>,
        dst: Arc<SoftwareResource>,
        scratch: Arc<SoftwareResource>,
        scratch_offset: u64,
        instances: BufferRange,
        instance_count: u32,
        flags: BuildAccelerationStructureFlags,
    },
    CopyAccelerationStructure {
        src: Arc<SoftwareResource>,
        dst: Arc<SoftwareResource>,
        mode: CopyAccelerationStructureMode,
    },
    CopyBuffer {
        src: Arc<SoftwareResource>,
        dst: Arc<SoftwareResource>,
        regions: Vec<BufferCopyRegion>,
    },
    CopyBufferToTexture {
        src: Arc<SoftwareResource>,
        dst: Arc<SoftwareResource>,
        regions: Vec<BufferToTextureCopyRegion>,
    },
    CopyTextureToBuffer {
        src: Arc<SoftwareResource>,
        dst: Arc<SoftwareResource>,
        regions: Vec<BufferToTextureCopyRegion>,
    },
    CopyTexture {
        src: Arc<SoftwareResource>,
        dst: Arc<SoftwareResource>,
        regions: Vec<TextureCopyRegion>,
    },
    WriteCompactedSizes {
        structures: Vec<Arc<SoftwareResource>>,
        heap: Arc<SoftwareQueryHeap>,
        first_query: u32,
    },
    ResolveQueryData {
        heap: Arc<SoftwareQueryHeap>,
        first_query: u32,
        query_count: u32,
        dst: Arc<SoftwareResource>,
        dst_offset: u64,
    },
}

struct Recording {
    state: CommandListState,
    commands: Vec<Command>,
    pipeline: Option<Arc<SoftwarePipeline>>,
    binding_set: Option<Arc<SoftwareBindingSet>>,
    in_render_pass: bool,
    event_depth: u32,
}

impl Recording {
    const fn new() -> Self {
        Self {
            state: CommandListState::Recording,
            commands: Vec::new(),
            pipeline: None,
            binding_set: None,
            in_render_pass: false,
            event_depth: 0,
        }
    }
}

pub struct SoftwareCommandList {
    list_type: CommandListType,
    features: SoftwareFeatures,
    recording: Mutex<Recording>,
    in_flight: AtomicU32,
    name: Mutex<String>,
}

impl_query_interface!(SoftwareCommandList);

fn software_resource(resource: &Arc<dyn Resource>) -> Arc<SoftwareResource> {
    cast_arc::<SoftwareResource>(Arc::clone(resource).into_any())
}

fn software_view(view: &Arc<dyn View>) -> Arc<SoftwareView> {
    cast_arc::<SoftwareView>(Arc::clone(view).into_any())
}

fn acceleration_structure(
    resource: &Arc<dyn Resource>,
    as_type: AccelerationStructureType,
) -> Arc<SoftwareResource> {
    let resource = software_resource(resource);
    let actual = resource.acceleration_structure().as_type;
    require!(actual == as_type, "expected a {as_type:?} acceleration structure, got {actual:?}");
    resource
}

fn shader_table(table: &RayTracingShaderTable) -> Option<BufferRange> {
    table.resource.as_ref().map(|resource| BufferRange {
        resource: software_resource(resource),
        offset: table.offset,
        size: table.size,
    })
}

impl SoftwareCommandList {
    pub fn new(list_type: CommandListType, features: SoftwareFeatures) -> Self {
        Self {
            list_type,
            features,
            recording: Mutex::new(Recording::new()),
            in_flight: AtomicU32::new(0),
            name: Mutex::new(String::new()),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Number of recorded commands.
    pub fn command_count(&self) -> usize {
        self.recording.lock().commands.len()
    }

    pub(crate) fn begin_execution(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Replay the recorded stream against device memory.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn execute(&self, context: &DeviceContext) {
        {
            let recording = self.recording.lock();
            let name = self.name();
            let mut executor = Executor::new(context, &name);
            for command in &recording.commands {
                executor.run(command);
            }
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Append a command built under the recording lock.
    fn record_with(&self, f: impl FnOnce(&mut Recording) -> Option<Command>) {
        let mut recording = self.recording.lock();
        require!(
            recording.state == CommandListState::Recording,
            "command recorded into closed list '{}'",
            self.name()
        );
        if let Some(command) = f(&mut recording) {
            recording.commands.push(command);
        }
    }

    fn record(&self, command: Command) {
        self.record_with(|_| Some(command));
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

    /// Contract checks shared by every draw.
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

    fn check_bindings(recording: &Recording, pipeline: &Arc<SoftwarePipeline>) {
        let layout = pipeline.software_layout();
        let desc = layout.desc();
        let declares_bindings = !desc.bind_keys.is_empty() || !desc.constants.is_empty();
        require!(
            !declares_bindings || recording.binding_set.is_some(),
            "pipeline layout declares bindings but no binding set is bound"
        );
    }

    fn record_indirect(
        &self,
        kind: IndirectKind,
        arguments: &Arc<dyn Resource>,
        offset: u64,
        count: Option<&IndirectCount>,
        max_count: u32,
        stride: u64,
    ) {
        let arguments = software_resource(arguments);
        let count = count.map(|count| (software_resource(&count.buffer), count.offset));
        self.record_with(|recording| {
            match kind {
                IndirectKind::Dispatch => Self::check_dispatch(recording, PipelineType::Compute),
                IndirectKind::Draw | IndirectKind::DrawIndexed => Self::check_draw(recording),
            }
            Some(Command::Indirect {
                kind,
                arguments,
                offset,
                count,
                max_count,
                stride,
            })
        });
    }
}

impl CommandList for SoftwareCommandList {
    fn list_type(&self) -> CommandListType {
        self.list_type
    }

    fn state(&self) -> CommandListState {
        self.recording.lock().state
    }

    fn reset(&self) -> Result<()> {
        require!(
            self.in_flight.load(Ordering::Acquire) == 0,
            "command list '{}' reset while the GPU is still executing it",
            self.name()
        );
        *self.recording.lock() = Recording::new();
        Ok(())
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
        recording.state = CommandListState::Closed;
        Ok(())
    }

    fn bind_pipeline(&self, pipeline: &Arc<dyn Pipeline>) {
        let pipeline = cast_arc::<SoftwarePipeline>(Arc::clone(pipeline).into_any());
        self.record_with(|recording| {
            if recording.pipeline.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, &pipeline)) {
                return None;
            }
            if let Some(set) = &recording.binding_set {
                if !Arc::ptr_eq(set.software_layout(), pipeline.software_layout()) {
                    recording.binding_set = None;
                }
            }
            recording.pipeline = Some(Arc::clone(&pipeline));
            Some(Command::BindPipeline(pipeline))
        });
    }

    fn bind_binding_set(&self, binding_set: &Arc<dyn BindingSet>) {
        let binding_set = cast_arc::<SoftwareBindingSet>(Arc::clone(binding_set).into_any());
        self.record_with(|recording| {
            let Some(pipeline) = &recording.pipeline else {
                prism_core::contract_violation!("binding set bound before any pipeline");
            };
            require!(
                same_object(binding_set.software_layout(), pipeline.software_layout()),
                "binding set layout differs from the bound pipeline's layout"
            );
            let bound = recording.binding_set.as_ref();
            if bound.is_some_and(|bound| Arc::ptr_eq(bound, &binding_set)) {
                return None;
            }
            recording.binding_set = Some(Arc::clone(&binding_set));
            Some(Command::BindBindingSet(binding_set))
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
            self.require_feature(self.features.variable_rate_shading, "variable-rate shading");
        }
        let begin = RenderPassBegin {
            render_pass: desc.render_pass.clone(),
            colors: desc.colors.iter().map(software_view).collect(),
            depth_stencil: desc.depth_stencil.as_ref().map(software_view),
            shading_rate_image: desc.shading_rate_image.as_ref().map(software_view),
            clear: desc.clear.clone(),
        };
        self.record_with(|recording| {
            require!(!recording.in_render_pass, "render pass begun inside another render pass");
            recording.in_render_pass = true;
            Some(Command::BeginRenderPass(begin))
        });
    }

    fn end_render_pass(&self) {
        self.record_with(|recording| {
            require!(recording.in_render_pass, "render pass ended without being begun");
            recording.in_render_pass = false;
            Some(Command::EndRenderPass)
        });
    }

    fn begin_event(&self, name: &str) {
        self.record_with(|recording| {
            recording.event_depth += 1;
            Some(Command::BeginEvent(name.to_string()))
        });
    }

    fn end_event(&self) {
        self.record_with(|recording| {
            require!(recording.event_depth > 0, "debug event ended without being begun");
            recording.event_depth -= 1;
            Some(Command::EndEvent)
        });
    }

    fn draw(&self, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.record_with(|recording| {
            Self::check_draw(recording);
            Some(Command::Draw {
                vertex_count,
                instance_count,
            })
        });
    }

    fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record_with(|recording| {
            Self::check_draw(recording);
            Some(Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
            })
        });
    }

    fn draw_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64) {
        let kind = IndirectKind::Draw;
        let stride = kind.command_size();
        self.record_indirect(kind, argument_buffer, argument_buffer_offset, None, 1, stride);
    }

    fn draw_indexed_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64) {
        let kind = IndirectKind::DrawIndexed;
        let stride = kind.command_size();
        self.record_indirect(kind, argument_buffer, argument_buffer_offset, None, 1, stride);
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
            self.require_feature(self.features.draw_indirect_count, "draw-indirect-count");
        }
        self.record_indirect(
            IndirectKind::Draw,
            argument_buffer,
            argument_buffer_offset,
            count,
            max_draw_count,
            u64::from(stride),
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
            self.require_feature(self.features.draw_indirect_count, "draw-indirect-count");
        }
        self.record_indirect(
            IndirectKind::DrawIndexed,
            argument_buffer,
            argument_buffer_offset,
            count,
            max_draw_count,
            u64::from(stride),
        );
    }

    fn dispatch(&self, thread_group_count_x: u32, thread_group_count_y: u32, thread_group_count_z: u32) {
        self.require_list_type(&[CommandListType::Graphics, CommandListType::Compute], "dispatch");
        self.record_with(|recording| {
            Self::check_dispatch(recording, PipelineType::Compute);
            Some(Command::Dispatch {
                groups: [thread_group_count_x, thread_group_count_y, thread_group_count_z],
                mesh: false,
            })
        });
    }

    fn dispatch_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64) {
        self.require_list_type(&[CommandListType::Graphics, CommandListType::Compute], "dispatch");
        let kind = IndirectKind::Dispatch;
        let stride = kind.command_size();
        self.record_indirect(kind, argument_buffer, argument_buffer_offset, None, 1, stride);
    }

    fn dispatch_mesh(&self, thread_group_count_x: u32, thread_group_count_y: u32, thread_group_count_z: u32) {
        self.require_feature(self.features.mesh_shading, "mesh shading");
        self.record_with(|recording| {
            Self::check_draw(recording);
            Some(Command::Dispatch {
                groups: [thread_group_count_x, thread_group_count_y, thread_group_count_z],
                mesh: true,
            })
        });
    }

    fn dispatch_rays(&self, shader_tables: &RayTracingShaderTables, width: u32, height: u32, depth: u32) {
        self.require_feature(self.features.ray_tracing, "ray tracing");
        self.require_list_type(
            &[CommandListType::Graphics, CommandListType::Compute],
            "dispatch_rays",
        );
        let all = [
            &shader_tables.raygen,
            &shader_tables.miss,
            &shader_tables.hit,
            &shader_tables.callable,
        ];
        let tables = all.map(shader_table);
        let strides = all.map(|table| table.stride);
        self.record_with(|recording| {
            Self::check_dispatch(recording, PipelineType::RayTracing);
            Some(Command::DispatchRays {
                tables,
                strides,
                size: [width, height, depth],
            })
        });
    }

    fn resource_barrier(&self, barriers: &[ResourceBarrierDesc]) {
        for barrier in barriers {
            let _ = software_resource(&barrier.resource);
        }
        if barriers.iter().all(ResourceBarrierDesc::is_elided) {
            return;
        }
        self.record(Command::Barriers(barriers.to_vec()));
    }

    fn uav_resource_barrier(&self, resource: Option<&Arc<dyn Resource>>) {
        if let Some(resource) = resource {
            let _ = software_resource(resource);
        }
        self.record(Command::UavBarrier);
    }

    fn set_viewport(&self, viewport: &Viewport) {
        require!(
            viewport.width > 0.0 && viewport.height > 0.0,
            "viewport of {}x{} is empty",
            viewport.width,
            viewport.height
        );
        self.record(Command::SetViewport(*viewport));
    }

    fn set_scissor_rect(&self, rect: &ScissorRect) {
        self.record(Command::SetScissorRect(*rect));
    }

    fn ia_set_index_buffer(&self, resource: &Arc<dyn Resource>, offset: u64, format: Format) {
        require!(
            matches!(format, Format::R16Uint | Format::R32Uint),
            "{format:?} is not an index format"
        );
        self.record(Command::SetIndexBuffer {
            resource: software_resource(resource),
            offset,
            format,
        });
    }

    fn ia_set_vertex_buffer(&self, slot: u32, resource: &Arc<dyn Resource>, offset: u64) {
        self.record(Command::SetVertexBuffer {
            slot,
            resource: software_resource(resource),
            offset,
        });
    }

    fn rs_set_shading_rate(&self, shading_rate: ShadingRate, combiners: [ShadingRateCombiner; 2]) {
        self.require_feature(self.features.variable_rate_shading, "variable-rate shading");
        self.record(Command::SetDynamicState(DynamicState::ShadingRate(shading_rate, combiners)));
    }

    fn set_depth_bounds(&self, min_depth_bounds: f32, max_depth_bounds: f32) {
        require!(
            min_depth_bounds <= max_depth_bounds,
            "depth bounds {min_depth_bounds}..{max_depth_bounds} are inverted"
        );
        self.record(Command::SetDynamicState(DynamicState::DepthBounds(
            min_depth_bounds,
            max_depth_bounds,
        )));
    }

    fn set_stencil_reference(&self, stencil_reference: u32) {
        self.record(Command::SetDynamicState(DynamicState::StencilReference(stencil_reference)));
    }

    fn set_blend_constants(&self, constants: [f32; 4]) {
        self.record(Command::SetDynamicState(DynamicState::BlendConstants(constants)));
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
        self.require_feature(self.features.ray_tracing, "ray tracing");
        self.require_list_type(
            &[CommandListType::Graphics, CommandListType::Compute],
            "acceleration-structure build",
        );
        let range = |buffer: &GeometryBuffer| {
            buffer.resource.as_ref().map(|resource| BufferRange {
                resource: software_resource(resource),
                offset: buffer.offset,
                size: u64::from(buffer.count) * buffer.stride(),
            })
        };
        let geometries = descs
            .iter()
            .map(|desc| GeometryRef {
                vertex: range(&desc.vertex),
                index: range(&desc.index),
            })
            .collect();
        self.record(Command::BuildBottomLevel {
            src: src.map(|src| acceleration_structure(src, AccelerationStructureType::BottomLevel)),
            dst: acceleration_structure(dst, AccelerationStructureType::BottomLevel),
            scratch: software_resource(scratch),
            scratch_offset,
            geometries,
            primitive_count: crate::acceleration::primitive_count(descs),
            flags,
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
        self.require_feature(self.features.ray_tracing, "ray tracing");
        self.require_list_type(
            &[CommandListType::Graphics, CommandListType::Compute],
            "acceleration-structure build",
        );
        let record_size = std::mem::size_of::<RaytracingGeometryInstance>() as u64;
        self.record(Command::BuildTopLevel {
            src: src.map(|src| acceleration_structure(src, AccelerationStructureType::TopLevel)),
            dst: acceleration_structure(dst, AccelerationStructureType::TopLevel),
            scratch: software_resource(scratch),
            scratch_offset,
            instances: BufferRange {
                resource: software_resource(instance_data),
                offset: instance_offset,
                size: u64::from(instance_count) * record_size,
            },
            instance_count,
            flags,
        });
    }

    fn copy_acceleration_structure(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        mode: CopyAccelerationStructureMode,
    ) {
        self.require_feature(self.features.ray_tracing, "ray tracing");
        let src = software_resource(src);
        let dst = software_resource(dst);
        let src_type = src.acceleration_structure().as_type;
        let dst_type = dst.acceleration_structure().as_type;
        require!(
            src_type == dst_type,
            "acceleration structure copy from {src_type:?} to {dst_type:?}"
        );
        self.record(Command::CopyAccelerationStructure { src, dst, mode });
    }

    fn copy_buffer(&self, src: &Arc<dyn Resource>, dst: &Arc<dyn Resource>, regions: &[BufferCopyRegion]) {
        self.record(Command::CopyBuffer {
            src: software_resource(src),
            dst: software_resource(dst),
            regions: regions.to_vec(),
        });
    }

    fn copy_buffer_to_texture(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[BufferToTextureCopyRegion],
    ) {
        let dst = software_resource(dst);
        let _ = dst.texture_layout();
        self.record(Command::CopyBufferToTexture {
            src: software_resource(src),
            dst,
            regions: regions.to_vec(),
        });
    }

    fn copy_texture_to_buffer(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[BufferToTextureCopyRegion],
    ) {
        let src = software_resource(src);
        let _ = src.texture_layout();
        self.record(Command::CopyTextureToBuffer {
            src,
            dst: software_resource(dst),
            regions: regions.to_vec(),
        });
    }

    fn copy_texture(&self, src: &Arc<dyn Resource>, dst: &Arc<dyn Resource>, regions: &[TextureCopyRegion]) {
        let src = software_resource(src);
        let dst = software_resource(dst);
        let _ = (src.texture_layout(), dst.texture_layout());
        self.record(Command::CopyTexture {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    fn write_acceleration_structures_properties(
        &self,
        acceleration_structures: &[Arc<dyn Resource>],
        query_heap: &Arc<dyn QueryHeap>,
        first_query: u32,
    ) {
        self.require_feature(self.features.ray_tracing, "ray tracing");
        require!(
            query_heap.heap_type() == QueryHeapType::AccelerationStructureCompactedSize,
            "compacted sizes written into a {:?} heap",
            query_heap.heap_type()
        );
        require!(
            first_query
                .checked_add(acceleration_structures.len() as u32)
                .is_some_and(|end| end <= query_heap.count()),
            "{} queries from {first_query} overrun a heap of {}",
            acceleration_structures.len(),
            query_heap.count()
        );
        let structures = acceleration_structures
            .iter()
            .map(|resource| {
                let resource = software_resource(resource);
                let _ = resource.acceleration_structure();
                resource
            })
            .collect();
        self.record(Command::WriteCompactedSizes {
            structures,
            heap: cast_arc::<SoftwareQueryHeap>(Arc::clone(query_heap).into_any()),
            first_query,
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
        self.record(Command::ResolveQueryData {
            heap: cast_arc::<SoftwareQueryHeap>(Arc::clone(query_heap).into_any()),
            first_query,
            query_count,
            dst: software_resource(dst_buffer),
            dst_offset,
        });
    }

    fn set_name(&self, name: &str) {
        name.clone_into(&mut *self.name.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::binding::{BindKey, BindingSetLayoutDesc, ShaderType};
    use prism_core::config::ValidationFilterConfig;
    use prism_core::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, ShaderBlob};
    use prism_core::resource::{BindFlag, BufferDesc};
    use prism_core::state::ResourceState;
    use prism_core::validation::ValidationFilter;
    use prism_core::view::ViewType;
    use prism_core::MemoryType;

    use crate::binding::SoftwareBindingSetLayout;
    use crate::config::{BindingModel, SoftwareDeviceConfig};

    fn context() -> Arc<DeviceContext> {
        DeviceContext::new(
            SoftwareDeviceConfig::default(),
            Arc::new(ValidationFilter::new(ValidationFilterConfig::default())),
        )
    }

    fn list() -> SoftwareCommandList {
        SoftwareCommandList::new(CommandListType::Graphics, SoftwareFeatures::default())
    }

    fn compute_pipeline(layout: &Arc<SoftwareBindingSetLayout>) -> Arc<dyn Pipeline> {
        let desc = ComputePipelineDesc {
            shader: ShaderBlob::new(ShaderType::Compute, "main", &[1, 2, 3, 4]),
            layout: Arc::clone(layout) as Arc<dyn BindingSetLayout>,
        };
        SoftwarePipeline::compute(1, &desc).unwrap()
    }

    fn empty_layout() -> Arc<SoftwareBindingSetLayout> {
        SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::default(), &BindingModel::default()).unwrap()
    }

    fn buffer(context: &DeviceContext) -> Arc<dyn Resource> {
        SoftwareResource::new_buffer(
            &BufferDesc::new(256, BindFlag::UNORDERED_ACCESS, MemoryType::Default),
            context.next_id(),
            &context.accounting,
        )
        .unwrap()
    }

    #[test]
    fn close_is_idempotent_and_reset_reopens() {
        let list = list();
        list.close().unwrap();
        list.close().unwrap();
        assert_eq!(list.state(), CommandListState::Closed);
        list.reset().unwrap();
        assert_eq!(list.state(), CommandListState::Recording);
        assert_eq!(list.command_count(), 0);
    }

    #[test]
    #[should_panic(expected = "closed list")]
    fn recording_into_closed_list_is_fatal() {
        let list = list();
        list.close().unwrap();
        list.set_stencil_reference(1);
    }

    #[test]
    #[should_panic(expected = "still executing")]
    fn reset_while_executing_is_fatal() {
        let list = list();
        list.close().unwrap();
        list.begin_execution();
        list.reset().unwrap();
    }

    #[test]
    fn rebinding_the_same_pipeline_is_skipped() {
        let pipeline = compute_pipeline(&empty_layout());
        let list = list();
        list.bind_pipeline(&pipeline);
        list.bind_pipeline(&pipeline);
        list.dispatch(1, 1, 1);
        assert_eq!(list.command_count(), 2);
    }

    #[test]
    #[should_panic(expected = "outside a render pass")]
    fn draw_outside_render_pass_is_fatal() {
        let list = list();
        list.draw(3, 1, 0, 0);
    }

    #[test]
    #[should_panic(expected = "without a bound pipeline")]
    fn dispatch_without_pipeline_is_fatal() {
        let list = list();
        list.dispatch(1, 1, 1);
    }

    #[test]
    #[should_panic(expected = "no binding set is bound")]
    fn dispatch_without_declared_bindings_is_fatal() {
        let key = BindKey::new(ShaderType::Compute, ViewType::RWBuffer, 0, 0);
        let layout =
            SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::new([key]), &BindingModel::default()).unwrap();
        let list = list();
        list.bind_pipeline(&compute_pipeline(&layout));
        list.dispatch(1, 1, 1);
    }

    #[test]
    #[should_panic(expected = "layout differs")]
    fn binding_set_with_foreign_layout_is_fatal() {
        let context = context();
        let list = list();
        list.bind_pipeline(&compute_pipeline(&empty_layout()));
        let set: Arc<dyn BindingSet> = SoftwareBindingSet::new(empty_layout(), &context).unwrap();
        list.bind_binding_set(&set);
    }

    #[test]
    fn elided_barriers_record_nothing() {
        let context = context();
        let buffer = buffer(&context);
        let list = list();
        let state = ResourceState::UNORDERED_ACCESS;
        list.resource_barrier(&[ResourceBarrierDesc::new(&buffer, state, state)]);
        assert_eq!(list.command_count(), 0);
        list.resource_barrier(&[ResourceBarrierDesc::new(&buffer, ResourceState::COMMON, state)]);
        assert_eq!(list.command_count(), 1);
    }

    #[test]
    #[should_panic(expected = "mesh shading")]
    fn mesh_dispatch_needs_the_feature() {
        let features = SoftwareFeatures {
            mesh_shading: false,
            ..SoftwareFeatures::default()
        };
        let list = SoftwareCommandList::new(CommandListType::Graphics, features);
        list.dispatch_mesh(1, 1, 1);
    }

    #[test]
    #[should_panic(expected = "open debug events")]
    fn closing_with_open_event_is_fatal() {
        let list = list();
        list.begin_event("frame");
        let _ = list.close();
    }

    #[test]
    fn graphics_pipeline_checks_pass_state() {
        let layout = empty_layout();
        let desc = GraphicsPipelineDesc::new(
            vec![
                ShaderBlob::new(ShaderType::Vertex, "main", &[1]),
                ShaderBlob::new(ShaderType::Pixel, "main", &[1]),
            ],
            &(Arc::clone(&layout) as Arc<dyn BindingSetLayout>),
            RenderPassDesc::single_color(Format::Rgba8Unorm),
        );
        let pipeline: Arc<dyn Pipeline> = SoftwarePipeline::graphics(2, &desc).unwrap();
        let list = list();
        list.bind_pipeline(&pipeline);
        list.begin_render_pass(&RenderPassBeginDesc::default());
        list.draw(3, 1, 0, 0);
        list.end_render_pass();
        list.close().unwrap();
        assert_eq!(list.command_count(), 4);
    }
}
