//! Pipeline descriptions and the pipeline object.

use std::sync::Arc;

use crate::binding::{BindingSetLayout, ShaderType};
use crate::error::Result;
use crate::format::Format;
use crate::interface::QueryInterface;
use crate::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineType {
    Graphics,
    Compute,
    RayTracing,
}

/// Bytecode dialect a backend consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderBlobType {
    Dxil,
    Spirv,
}

/// Compiled shader bytecode for one entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBlob {
    pub shader_type: ShaderType,
    pub entry_point: String,
    pub bytecode: Arc<[u8]>,
}

impl ShaderBlob {
    pub fn new(shader_type: ShaderType, entry_point: impl Into<String>, bytecode: &[u8]) -> Self {
        Self {
            shader_type,
            entry_point: entry_point.into(),
            bytecode: Arc::from(bytecode),
        }
    }
}

/// One vertex attribute fed from a vertex buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputLayoutDesc {
    pub slot: u32,
    pub location: u32,
    pub format: Format,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    Wireframe,
    #[default]
    Solid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RasterizerDesc {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub depth_bias: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Blend {
    #[default]
    Zero,
    SrcAlpha,
    InvSrcAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendOp {
    #[default]
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendDesc {
    pub blend_enable: bool,
    pub blend_src: Blend,
    pub blend_dest: Blend,
    pub blend_op: BlendOp,
    pub blend_src_alpha: Blend,
    pub blend_dest_alpha: Blend,
    pub blend_op_alpha: BlendOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComparisonFunc {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
    Incr,
    Decr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilOpDesc {
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub func: ComparisonFunc,
}

impl Default for StencilOpDesc {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            func: ComparisonFunc::Always,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_test_enable: bool,
    pub depth_func: ComparisonFunc,
    pub depth_write_enable: bool,
    pub depth_bounds_test_enable: bool,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front_face: StencilOpDesc,
    pub back_face: StencilOpDesc,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_test_enable: true,
            depth_func: ComparisonFunc::Less,
            depth_write_enable: true,
            depth_bounds_test_enable: false,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            front_face: StencilOpDesc::default(),
            back_face: StencilOpDesc::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderPassLoadOp {
    #[default]
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderPassStoreOp {
    #[default]
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderPassColorDesc {
    pub format: Format,
    pub load_op: RenderPassLoadOp,
    pub store_op: RenderPassStoreOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderPassDepthStencilDesc {
    pub format: Format,
    pub depth_load_op: RenderPassLoadOp,
    pub depth_store_op: RenderPassStoreOp,
    pub stencil_load_op: RenderPassLoadOp,
    pub stencil_store_op: RenderPassStoreOp,
}

/// Attachment formats and load/store behavior of a render pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassDesc {
    pub colors: Vec<RenderPassColorDesc>,
    pub depth_stencil: RenderPassDepthStencilDesc,
    pub shading_rate_format: Format,
    pub sample_count: u32,
}

impl Default for RenderPassDesc {
    fn default() -> Self {
        Self {
            colors: Vec::new(),
            depth_stencil: RenderPassDepthStencilDesc::default(),
            shading_rate_format: Format::Undefined,
            sample_count: 1,
        }
    }
}

impl RenderPassDesc {
    /// A single color attachment cleared on load.
    pub fn single_color(format: Format) -> Self {
        Self {
            colors: vec![RenderPassColorDesc {
                format,
                load_op: RenderPassLoadOp::Clear,
                store_op: RenderPassStoreOp::Store,
            }],
            ..Self::default()
        }
    }

    pub fn color_formats(&self) -> impl Iterator<Item = Format> + '_ {
        self.colors.iter().map(|color| color.format)
    }

    pub fn depth_stencil_format(&self) -> Option<Format> {
        (self.depth_stencil.format != Format::Undefined).then_some(self.depth_stencil.format)
    }
}

#[derive(Clone)]
pub struct GraphicsPipelineDesc {
    pub shaders: Vec<ShaderBlob>,
    pub layout: Arc<dyn BindingSetLayout>,
    pub input: Vec<InputLayoutDesc>,
    pub render_pass: RenderPassDesc,
    pub depth_stencil_desc: DepthStencilDesc,
    pub blend_desc: BlendDesc,
    pub rasterizer_desc: RasterizerDesc,
}

impl GraphicsPipelineDesc {
    pub fn new(
        shaders: Vec<ShaderBlob>,
        layout: &Arc<dyn BindingSetLayout>,
        render_pass: RenderPassDesc,
    ) -> Self {
        Self {
            shaders,
            layout: Arc::clone(layout),
            input: Vec::new(),
            render_pass,
            depth_stencil_desc: DepthStencilDesc::default(),
            blend_desc: BlendDesc::default(),
            rasterizer_desc: RasterizerDesc::default(),
        }
    }

    pub fn with_input(mut self, input: impl Into<Vec<InputLayoutDesc>>) -> Self {
        self.input = input.into();
        self
    }

    pub const fn with_depth_stencil(mut self, desc: DepthStencilDesc) -> Self {
        self.depth_stencil_desc = desc;
        self
    }

    pub const fn with_rasterizer(mut self, desc: RasterizerDesc) -> Self {
        self.rasterizer_desc = desc;
        self
    }

    pub const fn with_blend(mut self, desc: BlendDesc) -> Self {
        self.blend_desc = desc;
        self
    }
}

#[derive(Clone)]
pub struct ComputePipelineDesc {
    pub shader: ShaderBlob,
    pub layout: Arc<dyn BindingSetLayout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RayTracingShaderGroupType {
    #[default]
    General,
    TrianglesHitGroup,
    ProceduralHitGroup,
}

/// Shader group of a ray-tracing pipeline. Members index into
/// [`RayTracingPipelineDesc::shaders`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RayTracingShaderGroup {
    pub group_type: RayTracingShaderGroupType,
    pub general: Option<u32>,
    pub closest_hit: Option<u32>,
    pub any_hit: Option<u32>,
    pub intersection: Option<u32>,
}

impl RayTracingShaderGroup {
    pub const fn general(shader: u32) -> Self {
        Self {
            group_type: RayTracingShaderGroupType::General,
            general: Some(shader),
            closest_hit: None,
            any_hit: None,
            intersection: None,
        }
    }

    pub const fn triangles_hit(closest_hit: u32) -> Self {
        Self {
            group_type: RayTracingShaderGroupType::TrianglesHitGroup,
            general: None,
            closest_hit: Some(closest_hit),
            any_hit: None,
            intersection: None,
        }
    }
}

#[derive(Clone)]
pub struct RayTracingPipelineDesc {
    pub shaders: Vec<ShaderBlob>,
    pub layout: Arc<dyn BindingSetLayout>,
    pub groups: Vec<RayTracingShaderGroup>,
    pub max_recursion_depth: u32,
}

/// A region of a shader-binding-table buffer.
#[derive(Clone, Default)]
pub struct RayTracingShaderTable {
    pub resource: Option<Arc<dyn Resource>>,
    pub offset: u64,
    pub size: u64,
    pub stride: u64,
}

#[derive(Clone, Default)]
pub struct RayTracingShaderTables {
    pub raygen: RayTracingShaderTable,
    pub miss: RayTracingShaderTable,
    pub hit: RayTracingShaderTable,
    pub callable: RayTracingShaderTable,
}

/// Compiled shader state bound to exactly one binding-set layout.
pub trait Pipeline: QueryInterface {
    fn pipeline_type(&self) -> PipelineType;
    fn layout(&self) -> Arc<dyn BindingSetLayout>;

    /// Opaque handles of `group_count` shader groups starting at
    /// `first_group`, `shader_group_handle_size` bytes each.
    fn ray_tracing_shader_group_handles(&self, first_group: u32, group_count: u32)
        -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_stencil_defaults() {
        let desc = DepthStencilDesc::default();
        assert!(desc.depth_test_enable);
        assert!(desc.depth_write_enable);
        assert_eq!(desc.depth_func, ComparisonFunc::Less);
        assert_eq!(desc.stencil_read_mask, 0xff);
        assert_eq!(desc.front_face.func, ComparisonFunc::Always);
    }

    #[test]
    fn rasterizer_defaults_to_solid_without_culling() {
        let desc = RasterizerDesc::default();
        assert_eq!(desc.fill_mode, FillMode::Solid);
        assert_eq!(desc.cull_mode, CullMode::None);
    }

    #[test]
    fn single_color_pass() {
        let pass = RenderPassDesc::single_color(Format::Bgra8Unorm);
        assert_eq!(pass.color_formats().collect::<Vec<_>>(), [Format::Bgra8Unorm]);
        assert_eq!(pass.colors[0].load_op, RenderPassLoadOp::Clear);
        assert_eq!(pass.depth_stencil_format(), None);
    }
}
