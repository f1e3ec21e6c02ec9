//! Pipelines. Bytecode is kept but never executed.

use std::sync::Arc;

use prism_core::binding::{BindingSetLayout, ShaderType};
use prism_core::interface::cast_arc;
use prism_core::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, Pipeline, PipelineType, RayTracingPipelineDesc,
    RenderPassDesc, ShaderBlob,
};
use prism_core::{impl_query_interface, require, Result, RhiError};

use crate::binding::SoftwareBindingSetLayout;

/// Bytes of one shader-group handle.
pub const SHADER_GROUP_HANDLE_SIZE: u32 = 32;
/// Alignment of each record inside a shader table.
pub const SHADER_RECORD_ALIGNMENT: u32 = 32;
/// Alignment of the start of a shader table.
pub const SHADER_TABLE_ALIGNMENT: u32 = 64;

pub struct SoftwarePipeline {
    id: u64,
    pipeline_type: PipelineType,
    layout: Arc<SoftwareBindingSetLayout>,
    shaders: Vec<ShaderBlob>,
    render_pass: Option<RenderPassDesc>,
    group_count: u32,
}

impl_query_interface!(SoftwarePipeline);

fn software_layout(layout: &Arc<dyn BindingSetLayout>) -> Arc<SoftwareBindingSetLayout> {
    cast_arc::<SoftwareBindingSetLayout>(Arc::clone(layout).into_any())
}

fn check_shaders(shaders: &[ShaderBlob], allowed: &[ShaderType]) -> Result<()> {
    for shader in shaders {
        if shader.bytecode.is_empty() {
            return Err(RhiError::ShaderModule(format!(
                "{:?} shader '{}' has no bytecode",
                shader.shader_type, shader.entry_point
            )));
        }
        if !allowed.contains(&shader.shader_type) {
            return Err(RhiError::PipelineCreation(format!(
                "{:?} shader '{}' cannot be part of this pipeline",
                shader.shader_type, shader.entry_point
            )));
        }
    }
    Ok(())
}

impl SoftwarePipeline {
    pub fn graphics(id: u64, desc: &GraphicsPipelineDesc) -> Result<Arc<Self>> {
        check_shaders(
            &desc.shaders,
            &[
                ShaderType::Vertex,
                ShaderType::Pixel,
                ShaderType::Geometry,
                ShaderType::Amplification,
                ShaderType::Mesh,
            ],
        )?;
        let has_geometry_source = desc
            .shaders
            .iter()
            .any(|shader| matches!(shader.shader_type, ShaderType::Vertex | ShaderType::Mesh));
        if !has_geometry_source {
            return Err(RhiError::PipelineCreation(
                "graphics pipelines need a vertex or mesh shader".to_string(),
            ));
        }
        Ok(Arc::new(Self {
            id,
            pipeline_type: PipelineType::Graphics,
            layout: software_layout(&desc.layout),
            shaders: desc.shaders.clone(),
            render_pass: Some(desc.render_pass.clone()),
            group_count: 0,
        }))
    }

    pub fn compute(id: u64, desc: &ComputePipelineDesc) -> Result<Arc<Self>> {
        check_shaders(std::slice::from_ref(&desc.shader), &[ShaderType::Compute])?;
        Ok(Arc::new(Self {
            id,
            pipeline_type: PipelineType::Compute,
            layout: software_layout(&desc.layout),
            shaders: vec![desc.shader.clone()],
            render_pass: None,
            group_count: 0,
        }))
    }

    pub fn ray_tracing(id: u64, desc: &RayTracingPipelineDesc) -> Result<Arc<Self>> {
        check_shaders(&desc.shaders, &[ShaderType::Library])?;
        let shader_count = desc.shaders.len() as u32;
        for group in &desc.groups {
            let members = [group.general, group.closest_hit, group.any_hit, group.intersection];
            if let Some(index) = members.into_iter().flatten().find(|index| *index >= shader_count) {
                return Err(RhiError::PipelineCreation(format!(
                    "shader group references shader {index} of {shader_count}"
                )));
            }
        }
        Ok(Arc::new(Self {
            id,
            pipeline_type: PipelineType::RayTracing,
            layout: software_layout(&desc.layout),
            shaders: desc.shaders.clone(),
            render_pass: None,
            group_count: desc.groups.len() as u32,
        }))
    }

    pub const fn software_layout(&self) -> &Arc<SoftwareBindingSetLayout> {
        &self.layout
    }

    pub const fn render_pass(&self) -> Option<&RenderPassDesc> {
        self.render_pass.as_ref()
    }

    pub fn shaders(&self) -> &[ShaderBlob] {
        &self.shaders
    }
}

impl Pipeline for SoftwarePipeline {
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
        let mut handles = Vec::with_capacity((group_count * SHADER_GROUP_HANDLE_SIZE) as usize);
        for group in first_group..first_group + group_count {
            let mut handle = [0_u8; SHADER_GROUP_HANDLE_SIZE as usize];
            handle[..8].copy_from_slice(&self.id.to_le_bytes());
            handle[8..12].copy_from_slice(&group.to_le_bytes());
            handles.extend_from_slice(&handle);
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::binding::BindingSetLayoutDesc;
    use prism_core::format::Format;
    use prism_core::pipeline::RayTracingShaderGroup;

    use crate::config::BindingModel;

    fn layout() -> Arc<dyn BindingSetLayout> {
        SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::default(), &BindingModel::default()).unwrap()
    }

    fn blob(shader_type: ShaderType) -> ShaderBlob {
        ShaderBlob::new(shader_type, "main", &[0x03, 0x02, 0x23, 0x07])
    }

    #[test]
    fn graphics_needs_a_vertex_stage() {
        let desc = GraphicsPipelineDesc::new(
            vec![blob(ShaderType::Pixel)],
            &layout(),
            RenderPassDesc::single_color(Format::Rgba8Unorm),
        );
        assert!(matches!(
            SoftwarePipeline::graphics(1, &desc),
            Err(RhiError::PipelineCreation(_))
        ));

        let desc = GraphicsPipelineDesc::new(
            vec![blob(ShaderType::Vertex), blob(ShaderType::Pixel)],
            &layout(),
            RenderPassDesc::single_color(Format::Rgba8Unorm),
        );
        let pipeline = SoftwarePipeline::graphics(1, &desc).unwrap();
        assert_eq!(pipeline.pipeline_type(), PipelineType::Graphics);
    }

    #[test]
    fn empty_bytecode_is_rejected() {
        let desc = ComputePipelineDesc {
            shader: ShaderBlob::new(ShaderType::Compute, "main", &[]),
            layout: layout(),
        };
        assert!(matches!(
            SoftwarePipeline::compute(1, &desc),
            Err(RhiError::ShaderModule(_))
        ));
    }

    #[test]
    fn group_handles_are_unique_per_group() {
        let desc = RayTracingPipelineDesc {
            shaders: vec![blob(ShaderType::Library), blob(ShaderType::Library)],
            layout: layout(),
            groups: vec![RayTracingShaderGroup::general(0), RayTracingShaderGroup::triangles_hit(1)],
            max_recursion_depth: 1,
        };
        let pipeline = SoftwarePipeline::ray_tracing(7, &desc).unwrap();
        let handles = pipeline.ray_tracing_shader_group_handles(0, 2).unwrap();
        assert_eq!(handles.len(), 2 * SHADER_GROUP_HANDLE_SIZE as usize);
        let (first, second) = handles.split_at(SHADER_GROUP_HANDLE_SIZE as usize);
        assert_ne!(first, second);
    }

    #[test]
    fn group_references_are_checked() {
        let desc = RayTracingPipelineDesc {
            shaders: vec![blob(ShaderType::Library)],
            layout: layout(),
            groups: vec![RayTracingShaderGroup::triangles_hit(3)],
            max_recursion_depth: 1,
        };
        assert!(SoftwarePipeline::ray_tracing(1, &desc).is_err());
    }
}
