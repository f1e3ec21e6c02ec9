//! Command lists, command queues and the data they record.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::acceleration::{
    BuildAccelerationStructureFlags, CopyAccelerationStructureMode, RaytracingGeometryDesc,
};
use crate::binding::BindingSet;
use crate::error::Result;
use crate::fence::Fence;
use crate::format::Format;
use crate::interface::QueryInterface;
use crate::pipeline::{Pipeline, RayTracingShaderTables, RenderPassDesc};
use crate::query::QueryHeap;
use crate::resource::Resource;
use crate::state::ResourceBarrierDesc;
use crate::view::View;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandListType {
    Graphics,
    Compute,
    Copy,
}

/// Recording state of a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListState {
    Recording,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureOffset {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureExtent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub num_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferToTextureCopyRegion {
    pub buffer_offset: u64,
    pub buffer_row_pitch: u32,
    pub texture_mip_level: u32,
    pub texture_array_layer: u32,
    pub texture_offset: TextureOffset,
    pub texture_extent: TextureExtent3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureCopyRegion {
    pub extent: TextureExtent3D,
    pub src_mip_level: u32,
    pub src_array_layer: u32,
    pub src_offset: TextureOffset,
    pub dst_mip_level: u32,
    pub dst_array_layer: u32,
    pub dst_offset: TextureOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub const fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ShadingRate {
    #[default]
    Rate1x1 = 0,
    Rate1x2 = 0x1,
    Rate2x1 = 0x4,
    Rate2x2 = 0x5,
    Rate2x4 = 0x6,
    Rate4x2 = 0x9,
    Rate4x4 = 0xa,
}

impl ShadingRate {
    /// Fragment size in pixels as `(width, height)`.
    pub const fn fragment_size(self) -> (u32, u32) {
        let bits = self as u8;
        (1 << (bits >> 2), 1 << (bits & 0x3))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShadingRateCombiner {
    #[default]
    Passthrough,
    Override,
    Min,
    Max,
    Sum,
}

/// Clear values for a render pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ClearDesc {
    pub colors: Vec<[f32; 4]>,
    pub depth: f32,
    pub stencil: u8,
}

impl Default for ClearDesc {
    fn default() -> Self {
        Self {
            colors: Vec::new(),
            depth: 1.0,
            stencil: 0,
        }
    }
}

/// Attachments bound for the duration of a render pass.
#[derive(Clone, Default)]
pub struct RenderPassBeginDesc {
    pub render_pass: RenderPassDesc,
    pub colors: Vec<Arc<dyn View>>,
    pub depth_stencil: Option<Arc<dyn View>>,
    pub shading_rate_image: Option<Arc<dyn View>>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub clear: ClearDesc,
}

impl RenderPassBeginDesc {
    /// One color attachment cleared to `clear_color`.
    pub fn clear_color(
        view: &Arc<dyn View>,
        format: Format,
        width: u32,
        height: u32,
        clear_color: [f32; 4],
    ) -> Self {
        Self {
            render_pass: RenderPassDesc::single_color(format),
            colors: vec![Arc::clone(view)],
            width,
            height,
            layers: 1,
            clear: ClearDesc {
                colors: vec![clear_color],
                ..ClearDesc::default()
            },
            ..Self::default()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndirectCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchIndirectCommand {
    pub thread_group_count_x: u32,
    pub thread_group_count_y: u32,
    pub thread_group_count_z: u32,
}

/// GPU-side draw count read by the indirect-count draws.
pub type IndirectCountType = u32;

/// Optional count buffer of an indirect-count draw.
#[derive(Clone)]
pub struct IndirectCount {
    pub buffer: Arc<dyn Resource>,
    pub offset: u64,
}

/// Single-threaded recording buffer.
///
/// Recording into a closed list, or submitting one that is still recording,
/// is a contract violation. Each list is recorded from one thread at a time;
/// different lists may be recorded concurrently.
pub trait CommandList: QueryInterface {
    fn list_type(&self) -> CommandListType;
    fn state(&self) -> CommandListState;

    /// Reopen for recording. Only legal once the GPU has finished with the
    /// previous recording. Clears the bound pipeline and binding set.
    fn reset(&self) -> Result<()>;

    /// Finish recording. Closing an already closed list does nothing.
    fn close(&self) -> Result<()>;

    fn bind_pipeline(&self, pipeline: &Arc<dyn Pipeline>);
    fn bind_binding_set(&self, binding_set: &Arc<dyn BindingSet>);
    fn begin_render_pass(&self, desc: &RenderPassBeginDesc);
    fn end_render_pass(&self);
    fn begin_event(&self, name: &str);
    fn end_event(&self);

    fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn draw_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64);
    fn draw_indexed_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64);

    /// Indirect draws whose count is read from `count`; without a count
    /// buffer `max_draw_count` commands are drawn.
    fn draw_indirect_count(
        &self,
        argument_buffer: &Arc<dyn Resource>,
        argument_buffer_offset: u64,
        count: Option<&IndirectCount>,
        max_draw_count: u32,
        stride: u32,
    );
    fn draw_indexed_indirect_count(
        &self,
        argument_buffer: &Arc<dyn Resource>,
        argument_buffer_offset: u64,
        count: Option<&IndirectCount>,
        max_draw_count: u32,
        stride: u32,
    );

    fn dispatch(&self, thread_group_count_x: u32, thread_group_count_y: u32, thread_group_count_z: u32);
    fn dispatch_indirect(&self, argument_buffer: &Arc<dyn Resource>, argument_buffer_offset: u64);
    fn dispatch_mesh(&self, thread_group_count_x: u32, thread_group_count_y: u32, thread_group_count_z: u32);
    fn dispatch_rays(&self, shader_tables: &RayTracingShaderTables, width: u32, height: u32, depth: u32);

    fn resource_barrier(&self, barriers: &[ResourceBarrierDesc]);
    /// Order unordered-access writes against later accesses. `None`
    /// covers every resource.
    fn uav_resource_barrier(&self, resource: Option<&Arc<dyn Resource>>);

    fn set_viewport(&self, viewport: &Viewport);
    fn set_scissor_rect(&self, rect: &ScissorRect);
    fn ia_set_index_buffer(&self, resource: &Arc<dyn Resource>, offset: u64, format: Format);
    fn ia_set_vertex_buffer(&self, slot: u32, resource: &Arc<dyn Resource>, offset: u64);
    fn rs_set_shading_rate(&self, shading_rate: ShadingRate, combiners: [ShadingRateCombiner; 2]);
    fn set_depth_bounds(&self, min_depth_bounds: f32, max_depth_bounds: f32);
    fn set_stencil_reference(&self, stencil_reference: u32);
    fn set_blend_constants(&self, constants: [f32; 4]);

    #[allow(clippy::too_many_arguments)]
    fn build_bottom_level_as(
        &self,
        src: Option<&Arc<dyn Resource>>,
        dst: &Arc<dyn Resource>,
        scratch: &Arc<dyn Resource>,
        scratch_offset: u64,
        descs: &[RaytracingGeometryDesc],
        flags: BuildAccelerationStructureFlags,
    );
    #[allow(clippy::too_many_arguments)]
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
    );
    fn copy_acceleration_structure(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        mode: CopyAccelerationStructureMode,
    );

    fn copy_buffer(&self, src: &Arc<dyn Resource>, dst: &Arc<dyn Resource>, regions: &[BufferCopyRegion]);
    fn copy_buffer_to_texture(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[BufferToTextureCopyRegion],
    );
    fn copy_texture_to_buffer(
        &self,
        src: &Arc<dyn Resource>,
        dst: &Arc<dyn Resource>,
        regions: &[BufferToTextureCopyRegion],
    );
    fn copy_texture(&self, src: &Arc<dyn Resource>, dst: &Arc<dyn Resource>, regions: &[TextureCopyRegion]);

    /// Write the compacted size of each structure into consecutive queries
    /// starting at `first_query`.
    fn write_acceleration_structures_properties(
        &self,
        acceleration_structures: &[Arc<dyn Resource>],
        query_heap: &Arc<dyn QueryHeap>,
        first_query: u32,
    );
    /// Copy query results as 64-bit values into `dst_buffer`.
    fn resolve_query_data(
        &self,
        query_heap: &Arc<dyn QueryHeap>,
        first_query: u32,
        query_count: u32,
        dst_buffer: &Arc<dyn Resource>,
        dst_offset: u64,
    );

    fn set_name(&self, name: &str);
}

/// Ordered submission queue.
pub trait CommandQueue: QueryInterface {
    fn queue_type(&self) -> CommandListType;

    /// Make later submissions wait until `fence` reaches `value`. Blocks the
    /// queue, not the calling thread.
    fn wait(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<()>;

    /// Set `fence` to `value` once all prior submissions complete.
    fn signal(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<()>;

    fn execute_command_lists(&self, command_lists: &[Arc<dyn CommandList>]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shading_rate_fragment_sizes() {
        assert_eq!(ShadingRate::Rate1x1.fragment_size(), (1, 1));
        assert_eq!(ShadingRate::Rate1x2.fragment_size(), (1, 2));
        assert_eq!(ShadingRate::Rate2x1.fragment_size(), (2, 1));
        assert_eq!(ShadingRate::Rate2x4.fragment_size(), (2, 4));
        assert_eq!(ShadingRate::Rate4x4.fragment_size(), (4, 4));
    }

    #[test]
    fn indirect_command_layouts() {
        assert_eq!(std::mem::size_of::<DrawIndirectCommand>(), 16);
        assert_eq!(std::mem::size_of::<DrawIndexedIndirectCommand>(), 20);
        assert_eq!(std::mem::size_of::<DispatchIndirectCommand>(), 12);
    }

    #[test]
    fn clear_defaults() {
        let clear = ClearDesc::default();
        assert!(clear.colors.is_empty());
        assert!((clear.depth - 1.0).abs() < f32::EPSILON);
        assert_eq!(clear.stencil, 0);
    }
}
