//! Prism triangle
//!
//! Renders a colored triangle into swapchain back buffers and presents them.
//! The software backend runs headless for a fixed number of frames; the
//! Vulkan backend opens a window.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-triangle -- [OPTIONS]
//! ```
//!
//! ## Examples
//!
//! ```bash
//! # Windowed Vulkan, shaders compiled into ./spv
//! cargo run -p prism-triangle -- --shader-dir spv
//!
//! # Headless software run of 300 frames
//! cargo run -p prism-triangle -- --backend software --frames 300
//! ```
//!
//! ## Environment Variables
//!
//! - `PRISM_SHADER_DIR`: Shader directory used when `--shader-dir` is absent
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod options;
mod window;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use prism::{ApiType, Device, DeviceConfig, InstanceConfig, NativeSurface, SwapchainDesc};
use prism_test::{FrameLoop, ShaderSet, TriangleScene};
use tracing::info;

use crate::options::{print_help, Options};

fn main() -> anyhow::Result<()> {
    let options = Options::from_env()?;
    if options.help {
        print_help();
        return Ok(());
    }

    prism::logging::init_logging("info");
    info!(backend = %options.backend, "Prism triangle starting...");

    match options.backend {
        ApiType::Software => run_headless(&options),
        ApiType::Vulkan => window::run(options),
    }
}

/// Open the first adapter of the selected backend and load its shaders.
pub fn open_device(options: &Options) -> anyhow::Result<(Arc<dyn Device>, ShaderSet)> {
    let config = InstanceConfig::default().with_app_name("prism-triangle");
    let instance = prism::create_instance(options.backend, &config)?;
    let device = prism::create_device(&instance, &DeviceConfig::default())?;

    let shaders = match (options.backend, &options.shader_dir) {
        (ApiType::Software, _) => ShaderSet::placeholder(),
        (_, Some(dir)) => ShaderSet::load(dir)
            .with_context(|| format!("loading shaders from {}", dir.display()))?,
        (_, None) => ShaderSet::from_env()?,
    };
    Ok((device, shaders))
}

pub fn swapchain_desc(options: &Options, surface: NativeSurface, width: u32, height: u32) -> SwapchainDesc {
    SwapchainDesc::new(surface, width, height)
        .with_frame_count(options.frame_count)
        .with_vsync(options.vsync)
}

fn run_headless(options: &Options) -> anyhow::Result<()> {
    let (device, shaders) = open_device(options)?;
    let swapchain = device.create_swapchain(&swapchain_desc(
        options,
        NativeSurface::Headless,
        options.width,
        options.height,
    ))?;
    let scene = TriangleScene::new(&device, &shaders, swapchain.format())?;
    let mut frames = FrameLoop::new(&device, swapchain)?;

    let target = options.headless_frames();
    let start = Instant::now();
    for _ in 0..target {
        frames.render_frame(&scene)?;
    }
    frames.finish()?;

    let elapsed = start.elapsed();
    info!(
        frames = frames.frames(),
        elapsed_ms = elapsed.as_millis(),
        fps = frames.frames() as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "Headless run finished"
    );
    Ok(())
}
