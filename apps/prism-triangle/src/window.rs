//! Windowed presentation driven by the winit event loop.

use std::sync::Arc;

use prism::{Device, NativeSurface, RhiError};
use prism_test::{FrameLoop, TestError, TriangleScene};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::options::Options;
use crate::{open_device, swapchain_desc};

pub fn run(options: Options) -> anyhow::Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = TriangleApp {
        options,
        state: None,
        error: None,
    };
    event_loop.run_app(&mut app)?;

    app.error.map_or(Ok(()), Err)
}

struct TriangleApp {
    options: Options,
    state: Option<WindowState>,
    /// First fatal error, reported once the loop exits.
    error: Option<anyhow::Error>,
}

/// Fields drop in declaration order: the swapchain goes before the window
/// its surface was created from.
struct WindowState {
    frames: Option<FrameLoop>,
    /// Frames presented through swapchains already replaced.
    replaced_frames: u64,
    scene: TriangleScene,
    device: Arc<dyn Device>,
    window: Arc<Window>,
}

impl TriangleApp {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<WindowState> {
        let attributes = Window::default_attributes()
            .with_title("Prism triangle")
            .with_inner_size(PhysicalSize::new(self.options.width, self.options.height));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let (device, shaders) = open_device(&self.options)?;
        let size = window.inner_size();
        let frames = create_frame_loop(&self.options, &device, &window, size)?;
        let scene = TriangleScene::new(&device, &shaders, frames.format())?;

        Ok(WindowState {
            frames: Some(frames),
            replaced_frames: 0,
            scene,
            device,
            window,
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.shutdown();
        self.error.get_or_insert(e);
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        if let Some(mut state) = self.state.take() {
            if let Some(frames) = state.frames.as_mut() {
                if let Err(e) = frames.finish() {
                    error!("Failed to drain frames: {e}");
                }
            }
            info!(frames = state.presented(), "Presented frames");
        }
    }
}

fn create_frame_loop(
    options: &Options,
    device: &Arc<dyn Device>,
    window: &Window,
    size: PhysicalSize<u32>,
) -> anyhow::Result<FrameLoop> {
    let surface = NativeSurface::Window {
        display: window.display_handle()?.as_raw(),
        window: window.window_handle()?.as_raw(),
    };
    let swapchain = device.create_swapchain(&swapchain_desc(options, surface, size.width, size.height))?;
    Ok(FrameLoop::new(device, swapchain)?)
}

impl WindowState {
    /// Replace the swapchain after the window changed size. A minimized
    /// window keeps no swapchain until it is restored.
    fn resize(&mut self, options: &Options, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        if let Some(mut frames) = self.frames.take() {
            frames.finish()?;
            self.replaced_frames += frames.frames();
        }
        if size.width == 0 || size.height == 0 {
            debug!("Window minimized, swapchain released");
            return Ok(());
        }

        let frames = create_frame_loop(options, &self.device, &self.window, size)?;
        if frames.format() != self.scene.color_format() {
            anyhow::bail!(
                "swapchain format changed from {:?} to {:?}",
                self.scene.color_format(),
                frames.format()
            );
        }
        self.frames = Some(frames);
        debug!(width = size.width, height = size.height, "Swapchain recreated");
        Ok(())
    }

    fn presented(&self) -> u64 {
        self.replaced_frames + self.frames.as_ref().map_or(0, FrameLoop::frames)
    }

    /// Render one frame. Returns the number presented so far.
    fn render(&mut self, options: &Options) -> anyhow::Result<u64> {
        let Some(frames) = self.frames.as_mut() else {
            return Ok(self.presented());
        };
        match frames.render_frame(&self.scene) {
            Ok(_) => {}
            Err(TestError::Rhi(RhiError::InvalidState(reason))) => {
                debug!("Swapchain out of date ({reason}), recreating");
                self.resize(options, self.window.inner_size())?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(self.presented())
    }
}

impl ApplicationHandler for TriangleApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Window ready");
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                let Some(state) = self.state.as_mut() else {
                    return;
                };
                if let Err(e) = state.resize(&self.options, size) {
                    self.fail(event_loop, e);
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = self.state.as_mut() else {
                    return;
                };
                match state.render(&self.options) {
                    Ok(presented) => {
                        if self.options.frames.is_some_and(|limit| presented >= limit) {
                            info!(presented, "Frame limit reached");
                            self.shutdown();
                            event_loop.exit();
                        }
                    }
                    Err(e) => self.fail(event_loop, e),
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}
