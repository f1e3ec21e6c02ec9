//! The triangle scene and its presented frame loop.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use prism::{
    align_up, BindFlag, BindKey, BindingDesc, BindingSet, BindingSetLayoutDesc,
    BufferToTextureCopyRegion, CommandList, CommandListType, CommandQueue, Device, Fence, Format,
    GraphicsPipelineDesc, InputLayoutDesc, MemoryType, Pipeline, RenderPassBeginDesc,
    RenderPassDesc, Resource, ResourceBarrierDesc, ResourceState, RetainList, ScissorRect,
    ShaderType, Swapchain, TextureDesc, TextureExtent3D, View, ViewDesc, ViewDimension, ViewType,
    Viewport,
};

use crate::harness::TestContext;
use crate::shaders::ShaderSet;
use crate::{Result, TestError};

/// Color every frame is cleared to.
pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.2, 0.4, 1.0];

const VERTICES: [[f32; 3]; 3] = [[0.0, -0.5, 0.0], [0.5, 0.5, 0.0], [-0.5, 0.5, 0.0]];
const INDICES: [u32; 3] = [0, 1, 2];

/// Size of the constant buffer; one 256-byte constant-buffer region.
const CONSTANTS_SIZE: u64 = 256;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TriangleConstants {
    color: [f32; 4],
}

/// Geometry, pipeline and bindings of a single colored triangle.
pub struct TriangleScene {
    color_format: Format,
    pipeline: Arc<dyn Pipeline>,
    binding_set: Arc<dyn BindingSet>,
    vertex_buffer: Arc<dyn Resource>,
    index_buffer: Arc<dyn Resource>,
    constant_buffer: Arc<dyn Resource>,
}

impl TriangleScene {
    /// The one binding of the scene: the pixel shader's color constants.
    pub const CONSTANTS_KEY: BindKey = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 0, 0);

    pub fn new(device: &Arc<dyn Device>, shaders: &ShaderSet, color_format: Format) -> Result<Self> {
        let upload = |size: u64, usage: BindFlag| {
            device.create_buffer(&prism::BufferDesc::new(size, usage, MemoryType::Upload))
        };
        let vertex_buffer = upload(std::mem::size_of_val(&VERTICES) as u64, BindFlag::VERTEX_BUFFER)?;
        vertex_buffer.update_upload_buffer(0, bytemuck::cast_slice(&VERTICES))?;
        vertex_buffer.set_name("triangle vertices");
        let index_buffer = upload(std::mem::size_of_val(&INDICES) as u64, BindFlag::INDEX_BUFFER)?;
        index_buffer.update_upload_buffer(0, bytemuck::cast_slice(&INDICES))?;
        index_buffer.set_name("triangle indices");
        let constant_buffer = upload(CONSTANTS_SIZE, BindFlag::CONSTANT_BUFFER)?;
        constant_buffer.set_name("triangle constants");

        let layout = device.create_binding_set_layout(&BindingSetLayoutDesc::new([Self::CONSTANTS_KEY]))?;
        let constants_view = device.create_view(
            &constant_buffer,
            &ViewDesc::new(ViewType::ConstantBuffer, ViewDimension::Buffer),
        )?;
        let binding_set = device.create_binding_set(&layout)?;
        binding_set.write_bindings(&[BindingDesc::new(Self::CONSTANTS_KEY, &constants_view)])?;

        let pipeline = device.create_graphics_pipeline(
            &GraphicsPipelineDesc::new(shaders.blobs(), &layout, RenderPassDesc::single_color(color_format))
                .with_input([InputLayoutDesc {
                    slot: 0,
                    location: 0,
                    format: Format::Rgb32Float,
                    stride: 12,
                }]),
        )?;

        let scene = Self {
            color_format,
            pipeline,
            binding_set,
            vertex_buffer,
            index_buffer,
            constant_buffer,
        };
        scene.set_color([1.0, 0.5, 0.0, 1.0])?;
        Ok(scene)
    }

    pub const fn color_format(&self) -> Format {
        self.color_format
    }

    /// Update the triangle color. Only call while no frame reads the constants.
    pub fn set_color(&self, color: [f32; 4]) -> Result<()> {
        let constants = TriangleConstants { color };
        self.constant_buffer
            .update_upload_buffer(0, bytemuck::bytes_of(&constants))?;
        Ok(())
    }

    /// Record one frame into `target`: transition it out of `state_before`,
    /// clear, draw the triangle and leave it in `state_after`.
    pub fn record(
        &self,
        list: &Arc<dyn CommandList>,
        target: &Arc<dyn Resource>,
        target_view: &Arc<dyn View>,
        state_before: ResourceState,
        state_after: ResourceState,
    ) {
        let width = target.width() as u32;
        let height = target.height();
        list.begin_event("triangle");
        list.resource_barrier(&[ResourceBarrierDesc::new(
            target,
            state_before,
            ResourceState::RENDER_TARGET,
        )]);
        list.bind_pipeline(&self.pipeline);
        list.bind_binding_set(&self.binding_set);
        list.begin_render_pass(&RenderPassBeginDesc::clear_color(
            target_view,
            self.color_format,
            width,
            height,
            CLEAR_COLOR,
        ));
        list.set_viewport(&Viewport::new(width as f32, height as f32));
        list.set_scissor_rect(&ScissorRect {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        });
        list.ia_set_index_buffer(&self.index_buffer, 0, Format::R32Uint);
        list.ia_set_vertex_buffer(0, &self.vertex_buffer, 0);
        list.draw_indexed(INDICES.len() as u32, 1, 0, 0, 0);
        list.end_render_pass();
        list.resource_barrier(&[ResourceBarrierDesc::new(
            target,
            ResourceState::RENDER_TARGET,
            state_after,
        )]);
        list.end_event();
    }

    /// Render once into an offscreen texture and read back its top-left
    /// texel, which lies outside the triangle.
    pub fn render_offscreen(&self, context: &TestContext, width: u32, height: u32) -> Result<[u8; 4]> {
        let device = context.device();
        let texture = device.create_texture(
            &TextureDesc::new_2d(
                self.color_format,
                width,
                height,
                BindFlag::RENDER_TARGET | BindFlag::COPY_SOURCE,
            )
            .with_memory_type(Some(MemoryType::Default)),
        )?;
        texture.set_name("offscreen target");
        let view = device.create_view(
            &texture,
            &ViewDesc::new(ViewType::RenderTarget, ViewDimension::Texture2D),
        )?;
        let texel_size = self.color_format.block_size();
        let row_pitch = align_up(
            u64::from(width * texel_size),
            u64::from(device.texture_data_pitch_alignment()),
        );
        let readback = context.buffer(row_pitch * u64::from(height), BindFlag::COPY_DEST, MemoryType::Readback)?;

        let list = device.create_command_list(CommandListType::Graphics)?;
        self.record(
            &list,
            &texture,
            &view,
            ResourceState::UNDEFINED,
            ResourceState::COPY_SOURCE,
        );
        let region = BufferToTextureCopyRegion {
            buffer_row_pitch: row_pitch as u32,
            texture_extent: TextureExtent3D {
                width,
                height,
                depth: 1,
            },
            ..BufferToTextureCopyRegion::default()
        };
        list.copy_texture_to_buffer(&texture, &readback, &[region]);
        context.submit_and_wait(&list)?;

        let mut texel = [0; 4];
        readback.read_readback_buffer(0, &mut texel)?;
        Ok(texel)
    }
}

/// Per-frame loop over a swapchain.
///
/// Each back buffer owns a command list. A frame acquires an image, waits
/// on the CPU until that image's previous frame has finished, re-records
/// its list, and presents once the queue signals the frame's fence value.
pub struct FrameLoop {
    device: Arc<dyn Device>,
    swapchain: Arc<dyn Swapchain>,
    queue: Arc<dyn CommandQueue>,
    fence: Arc<dyn Fence>,
    fence_value: u64,
    command_lists: Vec<Arc<dyn CommandList>>,
    /// Fence value that retires the last frame rendered into each image.
    image_values: Vec<u64>,
    /// Transient per-frame objects, released once their frame retires.
    retained: RetainList,
    frames: u64,
}

impl FrameLoop {
    pub fn new(device: &Arc<dyn Device>, swapchain: Arc<dyn Swapchain>) -> Result<Self> {
        let frame_count = swapchain.frame_count() as usize;
        let command_lists = (0..frame_count)
            .map(|index| {
                let list = device.create_command_list(CommandListType::Graphics)?;
                list.set_name(&format!("frame {index}"));
                Ok(list)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            device: Arc::clone(device),
            queue: device.command_queue(CommandListType::Graphics),
            fence: device.create_fence(0)?,
            swapchain,
            fence_value: 0,
            command_lists,
            image_values: vec![0; frame_count],
            retained: RetainList::new(),
            frames: 0,
        })
    }

    /// Render and present one frame. Returns the fence value that marks
    /// its completion.
    pub fn render_frame(&mut self, scene: &TriangleScene) -> Result<u64> {
        if scene.color_format() != self.swapchain.format() {
            return Err(TestError::Mismatch(format!(
                "scene renders {:?} but the swapchain holds {:?}",
                scene.color_format(),
                self.swapchain.format()
            )));
        }
        let acquired = self.fence_value + 1;
        let index = self.swapchain.next_image(&self.fence, acquired)?;
        self.fence_value = acquired;
        let image = index as usize;

        self.fence.wait(self.image_values[image])?;
        self.retained.release_completed(self.fence.completed_value());

        let back_buffer = self.swapchain.back_buffer(index);
        let view = self.device.create_view(
            &back_buffer,
            &ViewDesc::new(ViewType::RenderTarget, ViewDimension::Texture2D),
        )?;
        let list = &self.command_lists[image];
        list.reset()?;
        scene.record(
            list,
            &back_buffer,
            &view,
            ResourceState::PRESENT,
            ResourceState::PRESENT,
        );
        list.close()?;

        self.queue.wait(&self.fence, acquired)?;
        self.queue.execute_command_lists(std::slice::from_ref(list))?;
        self.fence_value += 1;
        let rendered = self.fence_value;
        self.queue.signal(&self.fence, rendered)?;
        self.image_values[image] = rendered;
        self.retained.retain(rendered, view);

        self.swapchain.present(&self.fence, rendered)?;
        self.frames += 1;
        tracing::trace!(frame = self.frames, image, rendered, "Frame presented");
        Ok(rendered)
    }

    /// Block until every frame has retired.
    pub fn finish(&mut self) -> Result<()> {
        self.fence.wait(self.fence_value)?;
        self.retained.release_completed(self.fence.completed_value());
        Ok(())
    }

    /// Format of the swapchain back buffers.
    pub fn format(&self) -> Format {
        self.swapchain.format()
    }

    pub fn fence(&self) -> &Arc<dyn Fence> {
        &self.fence
    }

    pub const fn last_value(&self) -> u64 {
        self.fence_value
    }

    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// Per-frame objects not yet released.
    pub fn pending_objects(&self) -> usize {
        self.retained.len()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use prism::{NativeSurface, SwapchainDesc};

    use super::*;
    use crate::harness::TestBackend;

    fn unorm(texel: [u8; 4]) -> [f32; 4] {
        texel.map(|channel| f32::from(channel) / 255.0)
    }

    fn run_frames(backend: TestBackend, frames: u64) -> (TestContext, FrameLoop) {
        let context = TestContext::new(backend).unwrap();
        let swapchain = context
            .device()
            .create_swapchain(&SwapchainDesc::new(NativeSurface::Headless, 64, 48).with_frame_count(3))
            .unwrap();
        let scene = TriangleScene::new(context.device(), context.shaders(), swapchain.format()).unwrap();
        let mut frame_loop = FrameLoop::new(context.device(), swapchain).unwrap();
        for _ in 0..frames {
            frame_loop.render_frame(&scene).unwrap();
        }
        frame_loop.finish().unwrap();
        (context, frame_loop)
    }

    #[test]
    fn frame_loop_on_root_tables() {
        let (context, frame_loop) = run_frames(TestBackend::root_tables(), 5);
        assert_eq!(frame_loop.frames(), 5);
        assert_eq!(frame_loop.fence().completed_value(), frame_loop.last_value());
        assert_eq!(frame_loop.pending_objects(), 0);
        context.ensure_no_validation_errors().unwrap();
    }

    #[test]
    fn frame_loop_on_descriptor_sets() {
        let (context, frame_loop) = run_frames(TestBackend::descriptor_sets(), 4);
        assert_eq!(frame_loop.fence().completed_value(), frame_loop.last_value());
        context.ensure_no_validation_errors().unwrap();
    }

    #[test]
    fn mismatched_scene_format_is_refused() {
        let context = TestContext::new(TestBackend::root_tables()).unwrap();
        let swapchain = context
            .device()
            .create_swapchain(&SwapchainDesc::new(NativeSurface::Headless, 16, 16))
            .unwrap();
        let scene = TriangleScene::new(context.device(), context.shaders(), Format::Rgba16Float).unwrap();
        let mut frame_loop = FrameLoop::new(context.device(), swapchain).unwrap();
        assert!(matches!(frame_loop.render_frame(&scene), Err(TestError::Mismatch(_))));
    }

    #[test]
    fn offscreen_clear_color_is_read_back() {
        for backend in [TestBackend::root_tables(), TestBackend::descriptor_sets()] {
            let context = TestContext::new(backend).unwrap();
            let scene = TriangleScene::new(context.device(), context.shaders(), Format::Rgba8Unorm).unwrap();
            let texel = scene.render_offscreen(&context, 32, 32).unwrap();
            let color = unorm(texel);
            for (actual, expected) in color.iter().zip(CLEAR_COLOR) {
                assert_relative_eq!(*actual, expected, epsilon = 1.0 / 255.0);
            }
            context.ensure_no_validation_errors().unwrap();
        }
    }

    #[cfg(feature = "vulkan")]
    #[test]
    #[ignore = "Requires GPU hardware"]
    fn vulkan_offscreen_triangle() {
        let context = TestContext::new(TestBackend::Vulkan).unwrap();
        let scene = TriangleScene::new(context.device(), context.shaders(), Format::Rgba8Unorm).unwrap();
        let texel = scene.render_offscreen(&context, 64, 64).unwrap();
        let color = unorm(texel);
        for (actual, expected) in color.iter().zip(CLEAR_COLOR) {
            assert_relative_eq!(*actual, expected, epsilon = 1.0 / 255.0);
        }
        context.ensure_no_validation_errors().unwrap();
    }
}
