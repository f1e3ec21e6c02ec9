//! Presentable surfaces.

use std::sync::Arc;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::Result;
use crate::fence::Fence;
use crate::format::Format;
use crate::interface::QueryInterface;
use crate::resource::Resource;

/// Platform surface a swapchain presents to.
#[derive(Debug, Clone, Copy)]
pub enum NativeSurface {
    Window {
        display: RawDisplayHandle,
        window: RawWindowHandle,
    },
    /// No window system; back buffers are only rendered to.
    Headless,
}

// SAFETY: the raw handles are plain identifiers; the caller keeps the window
// alive for as long as any swapchain created from it.
unsafe impl Send for NativeSurface {}
// SAFETY: see above.
unsafe impl Sync for NativeSurface {}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface: NativeSurface,
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub vsync: bool,
}

impl SwapchainDesc {
    pub const fn new(surface: NativeSurface, width: u32, height: u32) -> Self {
        Self {
            surface,
            width,
            height,
            frame_count: 3,
            vsync: true,
        }
    }

    pub const fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }
}

/// Ring of presentable back buffers.
pub trait Swapchain: QueryInterface {
    fn format(&self) -> Format;
    fn frame_count(&self) -> u32;
    fn back_buffer(&self, index: u32) -> Arc<dyn Resource>;

    /// Acquire the next back buffer. `fence` reaches `signal_value` once the
    /// image may be rendered to.
    fn next_image(&self, fence: &Arc<dyn Fence>, signal_value: u64) -> Result<u32>;

    /// Present the current back buffer after `fence` reaches `wait_value`.
    /// The back buffer must already be in the present state.
    fn present(&self, fence: &Arc<dyn Fence>, wait_value: u64) -> Result<()>;
}
