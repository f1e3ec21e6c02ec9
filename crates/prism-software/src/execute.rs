//! Replay of recorded commands.
//!
//! The executor applies barriers to the state trackers, performs clears and
//! copies on resource memory, and builds acceleration-structure headers.
//! Shaders are never run. Usage errors that only show up on the GPU timeline
//! (wrong resource state, out-of-range indirect arguments, unbuilt
//! structures) go to the validation filter instead of aborting.

use std::collections::BTreeMap;
use std::sync::Arc;

use prism_core::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, CopyAccelerationStructureMode,
    RaytracingAsPrebuildInfo, RaytracingGeometryInstance,
};
use prism_core::command::{
    BufferCopyRegion, BufferToTextureCopyRegion, DrawIndexedIndirectCommand, TextureCopyRegion,
    TextureExtent3D, TextureOffset, Viewport,
};
use prism_core::format::Format;
use prism_core::pipeline::RenderPassLoadOp;
use prism_core::query::QUERY_RESULT_SIZE;
use prism_core::resource::Resource;
use prism_core::state::{effective_barriers, ResourceBarrierDesc, ResourceState};
use prism_core::view::View;

use crate::acceleration::{self, HEADER_SIZE};
use crate::binding::SoftwareBindingSet;
use crate::command_list::{BufferRange, Command, DynamicState, GeometryRef, IndirectKind, RenderPassBegin};
use crate::context::{Counter, DeviceContext};
use crate::pipeline::{SoftwarePipeline, SHADER_RECORD_ALIGNMENT, SHADER_TABLE_ALIGNMENT};
use crate::query::SoftwareQueryHeap;
use crate::resource::{BuiltStructure, SoftwareResource};
use crate::texel::{encode_color, encode_depth_stencil, SubresourceFootprint};
use crate::view::SoftwareView;

/// Copy-layout row pitch granularity for buffer/texture copies.
const COPY_ROW_PITCH_ALIGNMENT: u64 = 256;

struct IndexBuffer<'a> {
    resource: &'a Arc<SoftwareResource>,
    offset: u64,
    format: Format,
}

pub(crate) struct Executor<'a> {
    context: &'a DeviceContext,
    list_name: &'a str,
    pipeline: Option<&'a Arc<SoftwarePipeline>>,
    binding_set: Option<&'a Arc<SoftwareBindingSet>>,
    render_pass: Option<&'a RenderPassBegin>,
    viewport: Option<Viewport>,
    index_buffer: Option<IndexBuffer<'a>>,
    vertex_buffers: BTreeMap<u32, (&'a Arc<SoftwareResource>, u64)>,
}

impl<'a> Executor<'a> {
    pub fn new(context: &'a DeviceContext, list_name: &'a str) -> Self {
        Self {
            context,
            list_name,
            pipeline: None,
            binding_set: None,
            render_pass: None,
            viewport: None,
            index_buffer: None,
            vertex_buffers: BTreeMap::new(),
        }
    }

    fn error(&self, message: &str) {
        if self.list_name.is_empty() {
            self.context.report_error(message);
        } else {
            self.context.report_error(&format!("[{}] {message}", self.list_name));
        }
    }

    pub fn run(&mut self, command: &'a Command) {
        match command {
            Command::BindPipeline(pipeline) => self.pipeline = Some(pipeline),
            Command::BindBindingSet(set) => self.binding_set = Some(set),
            Command::BeginRenderPass(begin) => self.begin_render_pass(begin),
            Command::EndRenderPass => self.render_pass = None,
            Command::BeginEvent(name) => {
                tracing::trace!(list = self.list_name, event = %name, "Begin event");
            }
            Command::EndEvent => tracing::trace!(list = self.list_name, "End event"),
            Command::Draw {
                vertex_count,
                instance_count,
            } => {
                if self.check_draw() {
                    tracing::trace!(vertex_count, instance_count, "Draw");
                    self.context.stats.add(Counter::Draw, 1);
                }
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
            } => {
                if self.check_draw() && self.check_indices(*first_index, *index_count) {
                    tracing::trace!(index_count, instance_count, "Draw indexed");
                    self.context.stats.add(Counter::Draw, 1);
                }
            }
            Command::Indirect {
                kind,
                arguments,
                offset,
                count,
                max_count,
                stride,
            } => self.indirect(*kind, arguments, *offset, count.as_ref(), *max_count, *stride),
            Command::Dispatch { groups, mesh } => {
                let ready = if *mesh { self.check_draw() } else { self.check_bindings() };
                if ready {
                    tracing::trace!(?groups, mesh, "Dispatch");
                    let counter = if *mesh { Counter::Draw } else { Counter::Dispatch };
                    self.context.stats.add(counter, 1);
                }
            }
            Command::DispatchRays { tables, strides, size } => {
                self.dispatch_rays(tables, strides, *size);
            }
            Command::Barriers(barriers) => self.barriers(barriers),
            Command::UavBarrier => {}
            Command::SetViewport(viewport) => self.viewport = Some(*viewport),
            Command::SetScissorRect(_) => {}
            Command::SetDynamicState(state) => self.set_dynamic_state(state),
            Command::SetIndexBuffer {
                resource,
                offset,
                format,
            } => {
                self.index_buffer = Some(IndexBuffer {
                    resource,
                    offset: *offset,
                    format: *format,
                });
            }
            Command::SetVertexBuffer { slot, resource, offset } => {
                self.vertex_buffers.insert(*slot, (resource, *offset));
            }
            Command::BuildBottomLevel {
                src,
                dst,
                scratch,
                scratch_offset,
                geometries,
                primitive_count,
                flags,
            } => self.build_bottom_level(
                src.as_ref(),
                dst,
                (scratch.as_ref(), *scratch_offset),
                geometries,
                *primitive_count,
                *flags,
            ),
            Command::BuildTopLevel {
                src,
                dst,
                scratch,
                scratch_offset,
                instances,
                instance_count,
                flags,
            } => self.build_top_level(
                src.as_ref(),
                dst,
                (scratch.as_ref(), *scratch_offset),
                instances,
                *instance_count,
                *flags,
            ),
            Command::CopyAccelerationStructure { src, dst, mode } => {
                self.copy_acceleration_structure(src, dst, *mode);
            }
            Command::CopyBuffer { src, dst, regions } => self.copy_buffer(src, dst, regions),
            Command::CopyBufferToTexture { src, dst, regions } => {
                for region in regions {
                    self.copy_buffer_texture(src, dst, region, CopyDirection::BufferToTexture);
                }
            }
            Command::CopyTextureToBuffer { src, dst, regions } => {
                for region in regions {
                    self.copy_buffer_texture(dst, src, region, CopyDirection::TextureToBuffer);
                }
            }
            Command::CopyTexture { src, dst, regions } => {
                for region in regions {
                    self.copy_texture(src, dst, region);
                }
            }
            Command::WriteCompactedSizes {
                structures,
                heap,
                first_query,
            } => self.write_compacted_sizes(structures, heap, *first_query),
            Command::ResolveQueryData {
                heap,
                first_query,
                query_count,
                dst,
                dst_offset,
            } => self.resolve_query_data(heap, *first_query, *query_count, dst, *dst_offset),
        }
    }

    fn barriers(&self, barriers: &[ResourceBarrierDesc]) {
        let mut transitions = 0;
        for barrier in effective_barriers(barriers) {
            let resource = &barrier.resource;
            let mismatches = resource.base().state_tracker().lock().apply(barrier);
            for mismatch in mismatches {
                let promoted = mismatch.actual == ResourceState::COMMON
                    && resource.allow_common_state_promotion(barrier.state_before);
                if mismatch.expected == ResourceState::UNDEFINED || promoted {
                    continue;
                }
                self.error(&format!(
                    "barrier on '{}' expects {:?} but subresource (mip {}, layer {}) is in {:?}",
                    resource.base().name(),
                    mismatch.expected,
                    mismatch.mip_level,
                    mismatch.array_layer,
                    mismatch.actual
                ));
            }
            transitions += 1;
        }
        self.context.stats.add(Counter::Transition, transitions);
    }

    /// Whether one subresource is usable as `required`, reporting otherwise.
    fn check_state(
        &self,
        resource: &SoftwareResource,
        mip_level: u32,
        array_layer: u32,
        required: ResourceState,
        usage: &str,
    ) -> bool {
        let actual = resource.base().state_tracker().lock().subresource_state(mip_level, array_layer);
        let promoted = actual == ResourceState::COMMON && resource.allow_common_state_promotion(required);
        if actual.contains(required) || promoted {
            return true;
        }
        self.error(&format!(
            "'{}' used as {usage} in {actual:?}, needs {required:?}",
            resource.base().name()
        ));
        false
    }

    /// Whether `offset..offset + size` lies inside bound memory of `resource`.
    fn check_range(&self, resource: &SoftwareResource, offset: u64, size: u64, usage: &str) -> bool {
        if !resource.is_bound() {
            self.error(&format!("'{}' used as {usage} without bound memory", resource.base().name()));
            return false;
        }
        let in_range = offset.checked_add(size).is_some_and(|end| end <= resource.byte_size());
        if !in_range {
            self.error(&format!(
                "{usage} range {offset}..+{size} overruns '{}' of {} bytes",
                resource.base().name(),
                resource.byte_size()
            ));
        }
        in_range
    }

    fn begin_render_pass(&mut self, begin: &'a RenderPassBegin) {
        self.render_pass = Some(begin);
        let pass = &begin.render_pass;
        for (index, (view, color)) in begin.colors.iter().zip(&pass.colors).enumerate() {
            let resource = view.software_resource();
            if resource.format() != color.format {
                self.error(&format!(
                    "color attachment {index} is {:?} but the render pass expects {:?}",
                    resource.format(),
                    color.format
                ));
                continue;
            }
            if !self.check_view_state(view, ResourceState::RENDER_TARGET, "render target") {
                continue;
            }
            if color.load_op == RenderPassLoadOp::Clear {
                let value = begin.clear.colors.get(index).copied().unwrap_or_default();
                self.fill_view(view, &encode_color(color.format, value));
            }
        }
        if let Some(view) = &begin.depth_stencil {
            let depth = &pass.depth_stencil;
            let clears = depth.depth_load_op == RenderPassLoadOp::Clear
                || depth.stencil_load_op == RenderPassLoadOp::Clear;
            if self.check_view_state(view, ResourceState::DEPTH_STENCIL_WRITE, "depth-stencil target")
                && clears
            {
                let value = encode_depth_stencil(depth.format, begin.clear.depth, begin.clear.stencil);
                self.fill_view(view, &value);
            }
        }
        if let Some(view) = &begin.shading_rate_image {
            self.check_view_state(view, ResourceState::SHADING_RATE_SOURCE, "shading-rate image");
        }
    }

    fn check_view_state(&self, view: &SoftwareView, required: ResourceState, usage: &str) -> bool {
        let range = view.range();
        let resource = view.software_resource();
        let mut ok = resource.is_bound() || {
            self.error(&format!("'{}' used as {usage} without bound memory", resource.base().name()));
            false
        };
        for layer in range.base_array_layer..range.base_array_layer + range.layer_count {
            ok &= self.check_state(resource, range.base_mip_level, layer, required, usage);
        }
        ok
    }

    /// Fill the first mip level of every layer a view covers with `texel`.
    fn fill_view(&self, view: &SoftwareView, texel: &[u8]) {
        let range = view.range();
        let resource = view.software_resource();
        let layout = resource.texture_layout();
        let format = layout.format();
        for layer in range.base_array_layer..range.base_array_layer + range.layer_count {
            let footprint = layout.footprint(range.base_mip_level, layer);
            let row = texel.repeat(footprint.width.div_ceil(format.block_extent()) as usize);
            for z in 0..footprint.depth {
                for y in 0..format.row_count(footprint.height) {
                    let offset = footprint.offset
                        + u64::from(z) * footprint.slice_pitch
                        + u64::from(y) * footprint.row_pitch;
                    resource.write(offset, &row);
                }
            }
        }
        self.context.stats.add(Counter::Clear, 1);
    }

    /// Every binding-set resource must have memory.
    fn check_bindings(&self) -> bool {
        let Some(set) = self.binding_set else {
            return true;
        };
        let mut ok = true;
        for resource in set.referenced_resources() {
            if !resource.is_bound() {
                self.error(&format!("bound resource '{}' has no memory", resource.base().name()));
                ok = false;
            }
        }
        ok
    }

    fn set_dynamic_state(&self, state: &DynamicState) {
        match *state {
            DynamicState::DepthBounds(min, max) => {
                if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) {
                    self.error(&format!("depth bounds {min}..{max} outside 0..1"));
                }
            }
            DynamicState::StencilReference(reference) => {
                if reference > u32::from(u8::MAX) {
                    self.error(&format!("stencil reference {reference} does not fit 8 stencil bits"));
                }
            }
            DynamicState::BlendConstants(constants) => {
                if constants.iter().any(|value| !value.is_finite()) {
                    self.error(&format!("blend constants {constants:?} are not finite"));
                }
            }
            DynamicState::ShadingRate(rate, combiners) => {
                tracing::trace!(list = self.list_name, ?rate, ?combiners, "Shading rate");
            }
        }
    }

    fn check_draw(&self) -> bool {
        let (Some(pipeline), Some(pass)) = (self.pipeline, self.render_pass) else {
            return false;
        };
        if self.viewport.is_none() {
            self.error("draw without a viewport");
            return false;
        }
        if let Some(pipeline_pass) = pipeline.render_pass() {
            let matches = pipeline_pass.color_formats().eq(pass.render_pass.color_formats())
                && pipeline_pass.depth_stencil_format() == pass.render_pass.depth_stencil_format();
            if !matches {
                self.error("pipeline attachment formats differ from the active render pass");
                return false;
            }
        }
        let mut ok = self.check_bindings();
        for (slot, (resource, offset)) in &self.vertex_buffers {
            ok &= self.check_state(
                resource,
                0,
                0,
                ResourceState::VERTEX_AND_CONSTANT_BUFFER,
                &format!("vertex buffer {slot}"),
            );
            ok &= self.check_range(resource, *offset, 0, "vertex buffer");
        }
        ok
    }

    fn check_indices(&self, first_index: u32, index_count: u32) -> bool {
        let Some(index_buffer) = &self.index_buffer else {
            self.error("indexed draw without an index buffer");
            return false;
        };
        let index_size = u64::from(index_buffer.format.block_size());
        let start = index_buffer.offset + u64::from(first_index) * index_size;
        self.check_state(index_buffer.resource, 0, 0, ResourceState::INDEX_BUFFER, "index buffer")
            && self.check_range(
                index_buffer.resource,
                start,
                u64::from(index_count) * index_size,
                "index buffer",
            )
    }

    fn indirect(
        &self,
        kind: IndirectKind,
        arguments: &SoftwareResource,
        offset: u64,
        count: Option<&(Arc<SoftwareResource>, u64)>,
        max_count: u32,
        stride: u64,
    ) {
        let ready = match kind {
            IndirectKind::Dispatch => self.check_bindings(),
            IndirectKind::Draw | IndirectKind::DrawIndexed => self.check_draw(),
        };
        if !ready
            || !self.check_state(arguments, 0, 0, ResourceState::INDIRECT_ARGUMENT, "indirect arguments")
        {
            return;
        }
        let draw_count = match count {
            Some((buffer, count_offset)) => {
                let usage = "indirect count";
                if !self.check_state(buffer, 0, 0, ResourceState::INDIRECT_ARGUMENT, usage)
                    || !self.check_range(buffer, *count_offset, 4, usage)
                {
                    return;
                }
                let bytes = buffer.read(*count_offset, 4);
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).min(max_count)
            }
            None => max_count,
        };
        if draw_count == 0 {
            return;
        }
        let span = u64::from(draw_count - 1) * stride + kind.command_size();
        if !self.check_range(arguments, offset, span, "indirect arguments") {
            return;
        }
        if kind == IndirectKind::DrawIndexed {
            for draw in 0..u64::from(draw_count) {
                let bytes = arguments.read(offset + draw * stride, kind.command_size());
                let command: DrawIndexedIndirectCommand = bytemuck::pod_read_unaligned(&bytes);
                if !self.check_indices(command.first_index, command.index_count) {
                    return;
                }
            }
        }
        let counter = match kind {
            IndirectKind::Dispatch => Counter::Dispatch,
            IndirectKind::Draw | IndirectKind::DrawIndexed => Counter::Draw,
        };
        self.context.stats.add(counter, u64::from(draw_count));
    }

    fn dispatch_rays(&self, tables: &[Option<BufferRange>; 4], strides: &[u64; 4], size: [u32; 3]) {
        if !self.check_bindings() {
            return;
        }
        if tables[0].is_none() {
            self.error("dispatch_rays without a ray-generation table");
            return;
        }
        let names = ["ray-generation", "miss", "hit-group", "callable"];
        for ((table, stride), name) in tables.iter().zip(strides).zip(names) {
            let Some(table) = table else {
                continue;
            };
            if table.offset % u64::from(SHADER_TABLE_ALIGNMENT) != 0 {
                self.error(&format!(
                    "{name} table offset {} is not {SHADER_TABLE_ALIGNMENT}-byte aligned",
                    table.offset
                ));
                return;
            }
            if stride % u64::from(SHADER_RECORD_ALIGNMENT) != 0 {
                self.error(&format!(
                    "{name} table stride {stride} is not a multiple of {SHADER_RECORD_ALIGNMENT}"
                ));
                return;
            }
            if !self.check_range(&table.resource, table.offset, table.size, name) {
                return;
            }
        }
        tracing::trace!(?size, "Dispatch rays");
        self.context.stats.add(Counter::Dispatch, 1);
    }

    fn copy_buffer(&self, src: &SoftwareResource, dst: &SoftwareResource, regions: &[BufferCopyRegion]) {
        if !self.check_state(src, 0, 0, ResourceState::COPY_SOURCE, "copy source")
            || !self.check_state(dst, 0, 0, ResourceState::COPY_DEST, "copy destination")
        {
            return;
        }
        for region in regions {
            if self.check_range(src, region.src_offset, region.num_bytes, "copy source")
                && self.check_range(dst, region.dst_offset, region.num_bytes, "copy destination")
            {
                let bytes = src.read(region.src_offset, region.num_bytes);
                dst.write(region.dst_offset, &bytes);
                self.context.stats.add(Counter::Copy, 1);
            }
        }
    }

    fn copy_buffer_texture(
        &self,
        buffer: &SoftwareResource,
        texture: &SoftwareResource,
        region: &BufferToTextureCopyRegion,
        direction: CopyDirection,
    ) {
        let (buffer_state, texture_state) = match direction {
            CopyDirection::BufferToTexture => (ResourceState::COPY_SOURCE, ResourceState::COPY_DEST),
            CopyDirection::TextureToBuffer => (ResourceState::COPY_DEST, ResourceState::COPY_SOURCE),
        };
        let (mip, layer) = (region.texture_mip_level, region.texture_array_layer);
        if !self.check_state(buffer, 0, 0, buffer_state, "copy buffer")
            || !self.check_state(texture, mip, layer, texture_state, "copy texture")
        {
            return;
        }
        let layout = texture.texture_layout();
        let format = layout.format();
        let extent = region.texture_extent;
        let row_bytes = format.surface_pitch(extent.width, 1).0;
        let row_pitch = u64::from(region.buffer_row_pitch);
        if row_pitch % COPY_ROW_PITCH_ALIGNMENT != 0 || row_pitch < row_bytes {
            self.error(&format!(
                "buffer row pitch {row_pitch} must be a multiple of {COPY_ROW_PITCH_ALIGNMENT} \
                 covering {row_bytes} bytes"
            ));
            return;
        }
        let footprint = layout.footprint(mip, layer);
        let Some(origin) = self.texture_region(&footprint, region.texture_offset, extent) else {
            return;
        };
        let rows = u64::from(format.row_count(extent.height));
        let total_rows = rows * u64::from(extent.depth);
        if total_rows == 0 {
            return;
        }
        let span = (total_rows - 1) * row_pitch + row_bytes;
        if !self.check_range(buffer, region.buffer_offset, span, "copy buffer")
            || !self.check_range(texture, 0, layout.size(), "copy texture")
        {
            return;
        }
        let block_extent = format.block_extent();
        for z in 0..extent.depth {
            for row in 0..rows {
                let buffer_offset = region.buffer_offset + (u64::from(z) * rows + row) * row_pitch;
                let y = origin[1] + row as u32 * block_extent;
                let texture_offset = layout.texel_offset(&footprint, origin[0], y, origin[2] + z);
                match direction {
                    CopyDirection::BufferToTexture => {
                        texture.write(texture_offset, &buffer.read(buffer_offset, row_bytes));
                    }
                    CopyDirection::TextureToBuffer => {
                        buffer.write(buffer_offset, &texture.read(texture_offset, row_bytes));
                    }
                }
            }
        }
        self.context.stats.add(Counter::Copy, 1);
    }

    /// Validate a texel region against a subresource, returning its origin.
    fn texture_region(
        &self,
        footprint: &SubresourceFootprint,
        offset: TextureOffset,
        extent: TextureExtent3D,
    ) -> Option<[u32; 3]> {
        let origin = [offset.x, offset.y, offset.z].map(u32::try_from);
        let [Ok(x), Ok(y), Ok(z)] = origin else {
            self.error(&format!("negative texture offset {offset:?}"));
            return None;
        };
        let within = |start: u32, size: u32, limit: u32| start.checked_add(size).is_some_and(|end| end <= limit);
        let fits = within(x, extent.width, footprint.width)
            && within(y, extent.height, footprint.height)
            && within(z, extent.depth, footprint.depth);
        if !fits {
            self.error(&format!(
                "copy region {offset:?} + {extent:?} exceeds a {}x{}x{} subresource",
                footprint.width, footprint.height, footprint.depth
            ));
            return None;
        }
        Some([x, y, z])
    }

    fn copy_texture(&self, src: &SoftwareResource, dst: &SoftwareResource, region: &TextureCopyRegion) {
        let (src_layout, dst_layout) = (src.texture_layout(), dst.texture_layout());
        let format = src_layout.format();
        if format.block_size() != dst_layout.format().block_size() {
            self.error(&format!(
                "texture copy between incompatible formats {format:?} and {:?}",
                dst_layout.format()
            ));
            return;
        }
        let src_sub = (region.src_mip_level, region.src_array_layer);
        let dst_sub = (region.dst_mip_level, region.dst_array_layer);
        if !self.check_state(src, src_sub.0, src_sub.1, ResourceState::COPY_SOURCE, "copy source")
            || !self.check_state(dst, dst_sub.0, dst_sub.1, ResourceState::COPY_DEST, "copy destination")
            || !self.check_range(src, 0, src_layout.size(), "copy source")
            || !self.check_range(dst, 0, dst_layout.size(), "copy destination")
        {
            return;
        }
        let src_footprint = src_layout.footprint(src_sub.0, src_sub.1);
        let dst_footprint = dst_layout.footprint(dst_sub.0, dst_sub.1);
        let (Some(src_origin), Some(dst_origin)) = (
            self.texture_region(&src_footprint, region.src_offset, region.extent),
            self.texture_region(&dst_footprint, region.dst_offset, region.extent),
        ) else {
            return;
        };
        let row_bytes = format.surface_pitch(region.extent.width, 1).0;
        let block_extent = format.block_extent();
        for z in 0..region.extent.depth {
            for row in 0..format.row_count(region.extent.height) {
                let dy = row * block_extent;
                let from = src_layout.texel_offset(
                    &src_footprint,
                    src_origin[0],
                    src_origin[1] + dy,
                    src_origin[2] + z,
                );
                let to = dst_layout.texel_offset(
                    &dst_footprint,
                    dst_origin[0],
                    dst_origin[1] + dy,
                    dst_origin[2] + z,
                );
                dst.write(to, &src.read(from, row_bytes));
            }
        }
        self.context.stats.add(Counter::Copy, 1);
    }

    /// Scratch, source and destination checks shared by both build kinds.
    fn check_build(
        &self,
        src: Option<&Arc<SoftwareResource>>,
        dst: &SoftwareResource,
        scratch: (&SoftwareResource, u64),
        info: RaytracingAsPrebuildInfo,
    ) -> bool {
        let data = dst.acceleration_structure();
        if info.acceleration_structure_size > data.capacity() {
            self.error(&format!(
                "build needs {} bytes but the destination holds {}",
                info.acceleration_structure_size,
                data.capacity()
            ));
            return false;
        }
        let scratch_size = match src {
            Some(src) => {
                let updatable = src.acceleration_structure().built.lock().as_ref().is_some_and(|built| {
                    built.flags.contains(BuildAccelerationStructureFlags::ALLOW_UPDATE)
                });
                if !updatable {
                    self.error("update source was not built with ALLOW_UPDATE");
                    return false;
                }
                info.update_scratch_data_size
            }
            None => info.build_scratch_data_size,
        };
        let (scratch, scratch_offset) = scratch;
        self.check_state(scratch, 0, 0, ResourceState::UNORDERED_ACCESS, "build scratch")
            && self.check_range(scratch, scratch_offset, scratch_size, "build scratch")
            && self.check_range(
                &data.buffer,
                data.offset,
                info.acceleration_structure_size,
                "build destination",
            )
    }

    fn finish_build(&self, dst: &SoftwareResource, built: BuiltStructure) {
        let data = dst.acceleration_structure();
        dst.write(0, &acceleration::encode_header(data.as_type, built.element_count, built.flags));
        *data.built.lock() = Some(built);
        self.context.stats.add(Counter::Build, 1);
    }

    fn build_bottom_level(
        &self,
        src: Option<&Arc<SoftwareResource>>,
        dst: &SoftwareResource,
        scratch: (&SoftwareResource, u64),
        geometries: &[GeometryRef],
        primitive_count: u64,
        flags: BuildAccelerationStructureFlags,
    ) {
        let info = acceleration::blas_prebuild_info(primitive_count);
        if !self.check_build(src, dst, scratch, info) {
            return;
        }
        for (index, geometry) in geometries.iter().enumerate() {
            let Some(vertex) = &geometry.vertex else {
                self.error(&format!("geometry {index} has no vertex buffer"));
                return;
            };
            let indices = geometry.index.iter().map(|index| ("index", index));
            let buffers = std::iter::once(("vertex", vertex)).chain(indices);
            for (usage, range) in buffers {
                if !self.check_range(&range.resource, range.offset, range.size, usage) {
                    return;
                }
            }
        }
        self.finish_build(
            dst,
            BuiltStructure {
                size: info.acceleration_structure_size,
                compacted_size: acceleration::blas_compacted_size(primitive_count),
                element_count: u32::try_from(primitive_count).unwrap_or(u32::MAX),
                flags,
            },
        );
    }

    fn build_top_level(
        &self,
        src: Option<&Arc<SoftwareResource>>,
        dst: &SoftwareResource,
        scratch: (&SoftwareResource, u64),
        instances: &BufferRange,
        instance_count: u32,
        flags: BuildAccelerationStructureFlags,
    ) {
        let info = acceleration::tlas_prebuild_info(u64::from(instance_count));
        if !self.check_build(src, dst, scratch, info)
            || !self.check_range(&instances.resource, instances.offset, instances.size, "instance data")
        {
            return;
        }
        let bytes = instances.resource.read(instances.offset, instances.size);
        let record_size = std::mem::size_of::<RaytracingGeometryInstance>();
        for (index, record) in bytes.chunks_exact(record_size).enumerate() {
            let instance: RaytracingGeometryInstance = bytemuck::pod_read_unaligned(record);
            let handle = instance.acceleration_structure_handle;
            let built = self
                .context
                .resolve_acceleration_structure(handle)
                .filter(|blas| {
                    let data = blas.acceleration_structure();
                    data.as_type == AccelerationStructureType::BottomLevel && data.built.lock().is_some()
                });
            if built.is_none() {
                self.error(&format!(
                    "instance {index} references {handle:#x}, which is not a built bottom-level structure"
                ));
                return;
            }
        }
        self.finish_build(
            dst,
            BuiltStructure {
                size: info.acceleration_structure_size,
                compacted_size: info.acceleration_structure_size,
                element_count: instance_count,
                flags,
            },
        );
    }

    fn copy_acceleration_structure(
        &self,
        src: &SoftwareResource,
        dst: &SoftwareResource,
        mode: CopyAccelerationStructureMode,
    ) {
        let Some(built) = *src.acceleration_structure().built.lock() else {
            self.error("copy from an acceleration structure that was never built");
            return;
        };
        let size = match mode {
            CopyAccelerationStructureMode::Clone => built.size,
            CopyAccelerationStructureMode::Compact => {
                if !built.flags.contains(BuildAccelerationStructureFlags::ALLOW_COMPACTION) {
                    self.error("compacting a structure built without ALLOW_COMPACTION");
                    return;
                }
                built.compacted_size
            }
        };
        let capacity = dst.acceleration_structure().capacity();
        if size > capacity {
            self.error(&format!("copy needs {size} bytes but the destination holds {capacity}"));
            return;
        }
        let header = src.read(0, HEADER_SIZE);
        dst.write(0, &header);
        *dst.acceleration_structure().built.lock() = Some(BuiltStructure { size, ..built });
        self.context.stats.add(Counter::Copy, 1);
    }

    fn write_compacted_sizes(
        &self,
        structures: &[Arc<SoftwareResource>],
        heap: &SoftwareQueryHeap,
        first_query: u32,
    ) {
        let sizes: Vec<u64> = structures
            .iter()
            .map(|structure| {
                let built = *structure.acceleration_structure().built.lock();
                built.map_or_else(
                    || {
                        self.error("compacted size queried for an unbuilt acceleration structure");
                        0
                    },
                    |built| built.compacted_size,
                )
            })
            .collect();
        heap.write(first_query, &sizes);
    }

    fn resolve_query_data(
        &self,
        heap: &SoftwareQueryHeap,
        first_query: u32,
        query_count: u32,
        dst: &SoftwareResource,
        dst_offset: u64,
    ) {
        let size = u64::from(query_count) * QUERY_RESULT_SIZE;
        if !self.check_state(dst, 0, 0, ResourceState::COPY_DEST, "query destination")
            || !self.check_range(dst, dst_offset, size, "query destination")
        {
            return;
        }
        let bytes: Vec<u8> = heap
            .read(first_query, query_count)
            .into_iter()
            .flat_map(u64::to_le_bytes)
            .collect();
        dst.write(dst_offset, &bytes);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyDirection {
    BufferToTexture,
    TextureToBuffer,
}
