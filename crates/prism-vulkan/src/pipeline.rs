//! Graphics, compute and ray-tracing pipelines.
//!
//! Graphics pipelines target dynamic rendering, so no render pass or
//! framebuffer objects exist. Viewport, scissor, stencil reference and
//! blend constants are always dynamic.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io::Cursor;
use std::sync::Arc;

use ash::vk;
use prism_core::binding::{BindingSetLayout, ShaderType};
use prism_core::format::Format;
use prism_core::pipeline::{
    Blend, BlendDesc, BlendOp, ComparisonFunc, ComputePipelineDesc, CullMode, DepthStencilDesc,
    FillMode, GraphicsPipelineDesc, InputLayoutDesc, Pipeline, PipelineType, RayTracingPipelineDesc,
    RayTracingShaderGroupType, ShaderBlob, StencilOp, StencilOpDesc,
};
use prism_core::{impl_query_interface, require, Result, RhiError};

use crate::binding::{vulkan_layout, VulkanBindingSetLayout};
use crate::context::DeviceContext;
use crate::format::to_vk_format;

pub struct VulkanPipeline {
    context: Arc<DeviceContext>,
    pipeline_type: PipelineType,
    layout: Arc<VulkanBindingSetLayout>,
    pipeline: vk::Pipeline,
    group_count: u32,
}

impl_query_interface!(VulkanPipeline);

/// Shader modules kept alive until the pipeline is created.
struct ShaderModules<'a> {
    device: &'a ash::Device,
    modules: Vec<vk::ShaderModule>,
    entry_points: Vec<CString>,
}

impl<'a> ShaderModules<'a> {
    fn new(device: &'a ash::Device) -> Self {
        Self {
            device,
            modules: Vec::new(),
            entry_points: Vec::new(),
        }
    }

    fn add(&mut self, blob: &ShaderBlob) -> Result<()> {
        if blob.bytecode.is_empty() {
            return Err(RhiError::ShaderModule(format!(
                "{:?} shader '{}' has no bytecode",
                blob.shader_type, blob.entry_point
            )));
        }
        let code = ash::util::read_spv(&mut Cursor::new(&blob.bytecode[..]))
            .map_err(|e| RhiError::ShaderModule(format!("'{}': {e}", blob.entry_point)))?;
        let entry_point = CString::new(blob.entry_point.as_str())
            .map_err(|e| RhiError::ShaderModule(format!("'{}': {e}", blob.entry_point)))?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| RhiError::ShaderModule(format!("'{}': {e}", blob.entry_point)))?;
        self.modules.push(module);
        self.entry_points.push(entry_point);
        Ok(())
    }

    fn stage(&self, index: usize, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(stage)
            .module(self.modules[index])
            .name(&self.entry_points[index])
    }
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

fn shader_stage(shader_type: ShaderType) -> Result<vk::ShaderStageFlags> {
    Ok(match shader_type {
        ShaderType::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderType::Pixel => vk::ShaderStageFlags::FRAGMENT,
        ShaderType::Compute => vk::ShaderStageFlags::COMPUTE,
        ShaderType::Geometry => vk::ShaderStageFlags::GEOMETRY,
        ShaderType::Amplification => vk::ShaderStageFlags::TASK_EXT,
        ShaderType::Mesh => vk::ShaderStageFlags::MESH_EXT,
        ShaderType::Library | ShaderType::Unknown => {
            return Err(RhiError::PipelineCreation(format!(
                "{shader_type:?} shaders have no raster or compute stage"
            )))
        }
    })
}

const fn compare_op(func: ComparisonFunc) -> vk::CompareOp {
    match func {
        ComparisonFunc::Never => vk::CompareOp::NEVER,
        ComparisonFunc::Less => vk::CompareOp::LESS,
        ComparisonFunc::Equal => vk::CompareOp::EQUAL,
        ComparisonFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        ComparisonFunc::Greater => vk::CompareOp::GREATER,
        ComparisonFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
        ComparisonFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        ComparisonFunc::Always => vk::CompareOp::ALWAYS,
    }
}

const fn stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrSat => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrSat => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::Incr => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::Decr => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

const fn blend_factor(blend: Blend) -> vk::BlendFactor {
    match blend {
        Blend::Zero => vk::BlendFactor::ZERO,
        Blend::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        Blend::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
    }
}

const fn blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
    }
}

fn stencil_state(desc: &StencilOpDesc, depth_stencil: &DepthStencilDesc) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: stencil_op(desc.fail_op),
        pass_op: stencil_op(desc.pass_op),
        depth_fail_op: stencil_op(desc.depth_fail_op),
        compare_op: compare_op(desc.func),
        compare_mask: u32::from(depth_stencil.stencil_read_mask),
        write_mask: u32::from(depth_stencil.stencil_write_mask),
        reference: 0,
    }
}

fn color_blend_attachment(desc: &BlendDesc) -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(desc.blend_enable)
        .src_color_blend_factor(blend_factor(desc.blend_src))
        .dst_color_blend_factor(blend_factor(desc.blend_dest))
        .color_blend_op(blend_op(desc.blend_op))
        .src_alpha_blend_factor(blend_factor(desc.blend_src_alpha))
        .dst_alpha_blend_factor(blend_factor(desc.blend_dest_alpha))
        .alpha_blend_op(blend_op(desc.blend_op_alpha))
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

/// Vertex bindings and attributes; attributes of one slot are packed in
/// location order.
fn vertex_input(
    input: &[InputLayoutDesc],
) -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
    let mut by_slot: BTreeMap<u32, Vec<&InputLayoutDesc>> = BTreeMap::new();
    for element in input {
        by_slot.entry(element.slot).or_default().push(element);
    }
    let mut bindings = Vec::new();
    let mut attributes = Vec::new();
    for (slot, mut elements) in by_slot {
        elements.sort_by_key(|element| element.location);
        bindings.push(
            vk::VertexInputBindingDescription::default()
                .binding(slot)
                .stride(elements[0].stride)
                .input_rate(vk::VertexInputRate::VERTEX),
        );
        let mut offset = 0;
        for element in elements {
            attributes.push(
                vk::VertexInputAttributeDescription::default()
                    .location(element.location)
                    .binding(slot)
                    .format(to_vk_format(element.format))
                    .offset(offset),
            );
            offset += element.format.block_size();
        }
    }
    (bindings, attributes)
}

/// Stage of each library shader, from the role it plays in the groups.
///
/// The first general group is the ray-generation shader; later general
/// groups are miss shaders.
fn ray_tracing_stages(desc: &RayTracingPipelineDesc) -> Result<Vec<vk::ShaderStageFlags>> {
    let shader_count = desc.shaders.len();
    let mut stages = vec![vk::ShaderStageFlags::empty(); shader_count];
    let mut seen_raygen = false;
    let mut assign = |index: u32, stage: vk::ShaderStageFlags| -> Result<()> {
        let Some(slot) = stages.get_mut(index as usize) else {
            return Err(RhiError::PipelineCreation(format!(
                "shader group references shader {index} of {shader_count}"
            )));
        };
        if !slot.is_empty() && *slot != stage {
            return Err(RhiError::PipelineCreation(format!(
                "shader {index} used as both {slot:?} and {stage:?}"
            )));
        }
        *slot = stage;
        Ok(())
    };
    for group in &desc.groups {
        match group.group_type {
            RayTracingShaderGroupType::General => {
                let Some(general) = group.general else {
                    return Err(RhiError::PipelineCreation(
                        "general shader group without a shader".to_string(),
                    ));
                };
                let stage = if seen_raygen {
                    vk::ShaderStageFlags::MISS_KHR
                } else {
                    vk::ShaderStageFlags::RAYGEN_KHR
                };
                seen_raygen = true;
                assign(general, stage)?;
            }
            RayTracingShaderGroupType::TrianglesHitGroup
            | RayTracingShaderGroupType::ProceduralHitGroup => {
                if let Some(index) = group.closest_hit {
                    assign(index, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                }
                if let Some(index) = group.any_hit {
                    assign(index, vk::ShaderStageFlags::ANY_HIT_KHR)?;
                }
                if let Some(index) = group.intersection {
                    assign(index, vk::ShaderStageFlags::INTERSECTION_KHR)?;
                }
            }
        }
    }
    if let Some(unused) = stages.iter().position(|stage| stage.is_empty()) {
        return Err(RhiError::PipelineCreation(format!(
            "shader {unused} is not referenced by any group"
        )));
    }
    Ok(stages)
}

fn pipeline_creation_error(e: vk::Result) -> RhiError {
    RhiError::PipelineCreation(e.to_string())
}

impl VulkanPipeline {
    pub fn graphics(context: &Arc<DeviceContext>, desc: &GraphicsPipelineDesc) -> Result<Arc<Self>> {
        let layout = vulkan_layout(&desc.layout);
        let device = &context.device;
        let mut modules = ShaderModules::new(device);
        let mut stage_flags = Vec::with_capacity(desc.shaders.len());
        for shader in &desc.shaders {
            stage_flags.push(shader_stage(shader.shader_type)?);
            modules.add(shader)?;
        }
        if !desc
            .shaders
            .iter()
            .any(|shader| matches!(shader.shader_type, ShaderType::Vertex | ShaderType::Mesh))
        {
            return Err(RhiError::PipelineCreation(
                "graphics pipelines need a vertex or mesh shader".to_string(),
            ));
        }
        let stages: Vec<_> = stage_flags
            .iter()
            .enumerate()
            .map(|(index, &stage)| modules.stage(index, stage))
            .collect();

        let (bindings, attributes) = vertex_input(&desc.input);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = &desc.rasterizer_desc;
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(match rasterizer.fill_mode {
                FillMode::Solid => vk::PolygonMode::FILL,
                FillMode::Wireframe => vk::PolygonMode::LINE,
            })
            .cull_mode(match rasterizer.cull_mode {
                CullMode::None => vk::CullModeFlags::NONE,
                CullMode::Front => vk::CullModeFlags::FRONT,
                CullMode::Back => vk::CullModeFlags::BACK,
            })
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(rasterizer.depth_bias != 0)
            .depth_bias_constant_factor(rasterizer.depth_bias as f32)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::from_raw(desc.render_pass.sample_count.max(1)))
            .sample_shading_enable(false);

        let depth_stencil_desc = &desc.depth_stencil_desc;
        let has_depth = desc.render_pass.depth_stencil_format().is_some();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(has_depth && depth_stencil_desc.depth_test_enable)
            .depth_write_enable(has_depth && depth_stencil_desc.depth_write_enable)
            .depth_compare_op(compare_op(depth_stencil_desc.depth_func))
            .depth_bounds_test_enable(
                context.features.depth_bounds && depth_stencil_desc.depth_bounds_test_enable,
            )
            .stencil_test_enable(has_depth && depth_stencil_desc.stencil_enable)
            .front(stencil_state(&depth_stencil_desc.front_face, depth_stencil_desc))
            .back(stencil_state(&depth_stencil_desc.back_face, depth_stencil_desc))
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);

        let blend_attachments: Vec<_> = desc
            .render_pass
            .colors
            .iter()
            .map(|_| color_blend_attachment(&desc.blend_desc))
            .collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let mut dynamic_states = vec![
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::STENCIL_REFERENCE,
            vk::DynamicState::BLEND_CONSTANTS,
        ];
        if context.features.depth_bounds {
            dynamic_states.push(vk::DynamicState::DEPTH_BOUNDS);
        }
        if context.features.variable_rate_shading {
            dynamic_states.push(vk::DynamicState::FRAGMENT_SHADING_RATE_KHR);
        }
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> = desc.render_pass.color_formats().map(to_vk_format).collect();
        let depth_format = desc.render_pass.depth_stencil_format().unwrap_or(Format::Undefined);
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(to_vk_format(depth_format));
        if depth_format.has_stencil() {
            rendering_info = rendering_info.stencil_attachment_format(to_vk_format(depth_format));
        }

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .viewport_state(&viewport_state)
            .layout(layout.pipeline_layout())
            .push_next(&mut rendering_info);
        let uses_mesh_shader = desc.shaders.iter().any(|shader| shader.shader_type == ShaderType::Mesh);
        if !uses_mesh_shader {
            pipeline_info = pipeline_info
                .vertex_input_state(&vertex_input)
                .input_assembly_state(&input_assembly);
        }

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, e)| pipeline_creation_error(e))?;

        Ok(Arc::new(Self {
            context: Arc::clone(context),
            pipeline_type: PipelineType::Graphics,
            layout,
            pipeline: pipelines[0],
            group_count: 0,
        }))
    }

    pub fn compute(context: &Arc<DeviceContext>, desc: &ComputePipelineDesc) -> Result<Arc<Self>> {
        if desc.shader.shader_type != ShaderType::Compute {
            return Err(RhiError::PipelineCreation(format!(
                "{:?} shader '{}' cannot be part of a compute pipeline",
                desc.shader.shader_type, desc.shader.entry_point
            )));
        }
        let layout = vulkan_layout(&desc.layout);
        let device = &context.device;
        let mut modules = ShaderModules::new(device);
        modules.add(&desc.shader)?;
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(modules.stage(0, vk::ShaderStageFlags::COMPUTE))
            .layout(layout.pipeline_layout());
        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, e)| pipeline_creation_error(e))?;

        Ok(Arc::new(Self {
            context: Arc::clone(context),
            pipeline_type: PipelineType::Compute,
            layout,
            pipeline: pipelines[0],
            group_count: 0,
        }))
    }

    pub fn ray_tracing(context: &Arc<DeviceContext>, desc: &RayTracingPipelineDesc) -> Result<Arc<Self>> {
        let Some(loader) = &context.ray_tracing_pipeline_loader else {
            return Err(RhiError::ExtensionNotSupported(
                "VK_KHR_ray_tracing_pipeline".to_string(),
            ));
        };
        if let Some(shader) = desc.shaders.iter().find(|shader| shader.shader_type != ShaderType::Library) {
            return Err(RhiError::PipelineCreation(format!(
                "{:?} shader '{}' cannot be part of a ray-tracing pipeline",
                shader.shader_type, shader.entry_point
            )));
        }
        let stage_flags = ray_tracing_stages(desc)?;
        let layout = vulkan_layout(&desc.layout);
        let device = &context.device;
        let mut modules = ShaderModules::new(device);
        for shader in &desc.shaders {
            modules.add(shader)?;
        }
        let stages: Vec<_> = stage_flags
            .iter()
            .enumerate()
            .map(|(index, &stage)| modules.stage(index, stage))
            .collect();

        let groups: Vec<_> = desc
            .groups
            .iter()
            .map(|group| {
                let unused = |index: Option<u32>| index.unwrap_or(vk::SHADER_UNUSED_KHR);
                let info = vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR);
                match group.group_type {
                    RayTracingShaderGroupType::General => info
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(unused(group.general)),
                    RayTracingShaderGroupType::TrianglesHitGroup => info
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .closest_hit_shader(unused(group.closest_hit))
                        .any_hit_shader(unused(group.any_hit)),
                    RayTracingShaderGroupType::ProceduralHitGroup => info
                        .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                        .closest_hit_shader(unused(group.closest_hit))
                        .any_hit_shader(unused(group.any_hit))
                        .intersection_shader(unused(group.intersection)),
                }
            })
            .collect();

        let max_depth = context.capabilities.ray_tracing.max_ray_recursion_depth.max(1);
        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth.clamp(1, max_depth))
            .layout(layout.pipeline_layout());
        let pipelines = unsafe {
            loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        }
        .map_err(|(_pipelines, e)| pipeline_creation_error(e))?;

        tracing::debug!(
            shaders = desc.shaders.len(),
            groups = desc.groups.len(),
            "Ray tracing pipeline created"
        );
        Ok(Arc::new(Self {
            context: Arc::clone(context),
            pipeline_type: PipelineType::RayTracing,
            layout,
            pipeline: pipelines[0],
            group_count: desc.groups.len() as u32,
        }))
    }

    pub const fn native(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub const fn vulkan_layout(&self) -> &Arc<VulkanBindingSetLayout> {
        &self.layout
    }

    pub const fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.pipeline_type {
            PipelineType::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineType::Compute => vk::PipelineBindPoint::COMPUTE,
            PipelineType::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }
}

impl Pipeline for VulkanPipeline {
    fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    fn layout(&self) -> Arc<dyn BindingSetLayout> {
        Arc::clone(&self.layout) as Arc<dyn BindingSetLayout>
    }

    fn ray_tracing_shader_group_handles(&self, first_group: u32, group_count: u32) -> Result<Vec<u8>> {
        require!(
            self.pipeline_type == PipelineType::RayTracing,
            "shader group handles requested from a {:?} pipeline",
            self.pipeline_type
        );
        require!(
            first_group.checked_add(group_count).is_some_and(|end| end <= self.group_count),
            "groups {first_group}..{} requested from a pipeline with {} groups",
            first_group.saturating_add(group_count),
            self.group_count
        );
        let Some(loader) = &self.context.ray_tracing_pipeline_loader else {
            return Err(RhiError::ExtensionNotSupported(
                "VK_KHR_ray_tracing_pipeline".to_string(),
            ));
        };
        let handle_size = self.context.capabilities.ray_tracing.shader_group_handle_size as usize;
        let handles = unsafe {
            loader.get_ray_tracing_shader_group_handles(
                self.pipeline,
                first_group,
                group_count,
                handle_size * group_count as usize,
            )
        }
        .map_err(crate::error::VulkanError::from)?;
        Ok(handles)
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_pipeline(self.pipeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::pipeline::RayTracingShaderGroup;

    #[test]
    fn attributes_pack_per_slot() {
        let input = [
            InputLayoutDesc {
                slot: 0,
                location: 1,
                format: Format::Rgba32Float,
                stride: 28,
            },
            InputLayoutDesc {
                slot: 0,
                location: 0,
                format: Format::Rgb32Float,
                stride: 28,
            },
            InputLayoutDesc {
                slot: 1,
                location: 2,
                format: Format::Rg32Float,
                stride: 8,
            },
        ];
        let (bindings, attributes) = vertex_input(&input);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].stride, 28);
        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].binding, 1);
        assert_eq!(attributes[2].offset, 0);
    }

    #[test]
    fn group_roles_decide_library_stages() {
        let blob = ShaderBlob::new(ShaderType::Library, "main", &[0x03, 0x02, 0x23, 0x07]);
        let desc = RayTracingPipelineDesc {
            shaders: vec![blob.clone(), blob.clone(), blob],
            layout: dummy_layout(),
            groups: vec![
                RayTracingShaderGroup::general(0),
                RayTracingShaderGroup::general(1),
                RayTracingShaderGroup::triangles_hit(2),
            ],
            max_recursion_depth: 1,
        };
        let stages = ray_tracing_stages(&desc).unwrap();
        assert_eq!(
            stages,
            [
                vk::ShaderStageFlags::RAYGEN_KHR,
                vk::ShaderStageFlags::MISS_KHR,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR
            ]
        );
    }

    #[test]
    fn out_of_range_group_member_is_rejected() {
        let desc = RayTracingPipelineDesc {
            shaders: Vec::new(),
            layout: dummy_layout(),
            groups: vec![RayTracingShaderGroup::triangles_hit(3)],
            max_recursion_depth: 1,
        };
        assert!(matches!(
            ray_tracing_stages(&desc),
            Err(RhiError::PipelineCreation(_))
        ));
    }

    #[test]
    fn conversions() {
        assert_eq!(compare_op(ComparisonFunc::GreaterEqual), vk::CompareOp::GREATER_OR_EQUAL);
        assert_eq!(stencil_op(StencilOp::IncrSat), vk::StencilOp::INCREMENT_AND_CLAMP);
        assert_eq!(blend_factor(Blend::InvSrcAlpha), vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert!(shader_stage(ShaderType::Library).is_err());
    }

    fn dummy_layout() -> Arc<dyn BindingSetLayout> {
        struct Layout(prism_core::binding::BindingSetLayoutDesc);
        prism_core::impl_query_interface!(Layout);
        impl BindingSetLayout for Layout {
            fn desc(&self) -> &prism_core::binding::BindingSetLayoutDesc {
                &self.0
            }
        }
        Arc::new(Layout(prism_core::binding::BindingSetLayoutDesc::default()))
    }
}
