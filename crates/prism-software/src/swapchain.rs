//! Swapchains over host-memory back buffers.
//!
//! Presenting does not reach a window; it validates that the back buffer is
//! presentable and advances the frame counter.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use prism_core::fence::Fence;
use prism_core::format::Format;
use prism_core::resource::{BindFlag, Resource, TextureDesc};
use prism_core::state::ResourceState;
use prism_core::swapchain::{NativeSurface, Swapchain, SwapchainDesc};
use prism_core::{impl_query_interface, require, Result, RhiError};

use crate::context::DeviceContext;
use crate::resource::SoftwareResource;

/// Back-buffer format of every software swapchain.
pub const SWAPCHAIN_FORMAT: Format = Format::Bgra8Unorm;

pub struct SoftwareSwapchain {
    context: Arc<DeviceContext>,
    back_buffers: Vec<Arc<SoftwareResource>>,
    current: AtomicU32,
    presented: AtomicU64,
}

impl_query_interface!(SoftwareSwapchain);

impl SoftwareSwapchain {
    pub fn new(context: Arc<DeviceContext>, desc: &SwapchainDesc) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::SwapchainCreation(format!(
                "surface extent {}x{} is empty",
                desc.width, desc.height
            )));
        }
        if desc.frame_count == 0 {
            return Err(RhiError::SwapchainCreation("swapchain needs at least one frame".into()));
        }
        if let NativeSurface::Window { .. } = desc.surface {
            tracing::debug!("Software swapchain ignores the window surface");
        }

        let texture = TextureDesc::new_2d(
            SWAPCHAIN_FORMAT,
            desc.width,
            desc.height,
            BindFlag::RENDER_TARGET | BindFlag::COPY_SOURCE,
        );
        let back_buffers = (0..desc.frame_count)
            .map(|index| {
                let buffer = SoftwareResource::new_back_buffer(&texture, context.next_id(), &context.accounting)?;
                buffer.set_name(&format!("back buffer {index}"));
                Ok(buffer)
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            width = desc.width,
            height = desc.height,
            frames = desc.frame_count,
            "Software swapchain created"
        );
        Ok(Self {
            context,
            back_buffers,
            // The first next_image call lands on index 0.
            current: AtomicU32::new(desc.frame_count - 1),
            presented: AtomicU64::new(0),
        })
    }

    /// Frames presented so far.
    pub fn presented_frames(&self) -> u64 {
        self.presented.load(Ordering::Acquire)
    }

    pub fn current_index(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }
}

impl Swapchain for SoftwareSwapchain {
    fn format(&self) -> Format {
        SWAPCHAIN_FORMAT
    }

    fn frame_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    fn back_buffer(&self, index: u32) -> Arc<dyn Resource> {
        require!(
            index < self.frame_count(),
            "back buffer {index} of a {}-frame swapchain",
            self.frame_count()
        );
        Arc::clone(&self.back_buffers[index as usize]) as Arc<dyn Resource>
    }

    fn next_image(&self, fence: &Arc<dyn Fence>, signal_value: u64) -> Result<u32> {
        let count = self.frame_count();
        let index = (self.current.load(Ordering::Acquire) + 1) % count;
        self.current.store(index, Ordering::Release);
        fence.signal(signal_value)?;
        Ok(index)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn present(&self, fence: &Arc<dyn Fence>, wait_value: u64) -> Result<()> {
        fence.wait(wait_value)?;
        let back_buffer = &self.back_buffers[self.current_index() as usize];
        let state = back_buffer.base().state_tracker().lock().subresource_state(0, 0);
        if state != ResourceState::PRESENT {
            self.context.report_error(&format!(
                "'{}' presented in {state:?} instead of PRESENT",
                back_buffer.base().name()
            ));
        }
        let frame = self.presented.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(frame, index = self.current_index(), "Present");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::config::ValidationFilterConfig;
    use prism_core::validation::ValidationFilter;

    use crate::config::SoftwareDeviceConfig;
    use crate::fence::SoftwareFence;

    fn context() -> Arc<DeviceContext> {
        DeviceContext::new(
            SoftwareDeviceConfig::default(),
            Arc::new(ValidationFilter::new(ValidationFilterConfig::default())),
        )
    }

    fn fence() -> Arc<dyn Fence> {
        Arc::new(SoftwareFence::new(0, std::time::Duration::from_millis(100), std::sync::Weak::new()))
    }

    #[test]
    fn images_cycle_through_the_ring() {
        let swapchain =
            SoftwareSwapchain::new(context(), &SwapchainDesc::new(NativeSurface::Headless, 64, 32)).unwrap();
        let fence = fence();
        let indices: Vec<u32> = (1..=4).map(|value| swapchain.next_image(&fence, value).unwrap()).collect();
        assert_eq!(indices, [0, 1, 2, 0]);
        assert_eq!(fence.completed_value(), 4);
    }

    #[test]
    fn back_buffers_start_presentable() {
        let context = context();
        let swapchain = SoftwareSwapchain::new(
            Arc::clone(&context),
            &SwapchainDesc::new(NativeSurface::Headless, 8, 8).with_frame_count(2),
        )
        .unwrap();
        let fence = fence();
        swapchain.next_image(&fence, 1).unwrap();
        swapchain.present(&fence, 1).unwrap();
        assert_eq!(swapchain.presented_frames(), 1);
        assert_eq!(context.validation.error_count(), 0);
        let back_buffer = swapchain.back_buffer(0);
        assert_eq!(back_buffer.format(), Format::Bgra8Unorm);
        assert!(back_buffer.is_back_buffer());
    }

    #[test]
    fn present_outside_present_state_is_reported() {
        let context = context();
        let swapchain =
            SoftwareSwapchain::new(Arc::clone(&context), &SwapchainDesc::new(NativeSurface::Headless, 8, 8)).unwrap();
        let fence = fence();
        let index = swapchain.next_image(&fence, 1).unwrap();
        swapchain
            .back_buffer(index)
            .base()
            .state_tracker()
            .lock()
            .set_resource_state(ResourceState::RENDER_TARGET);
        swapchain.present(&fence, 1).unwrap();
        assert_eq!(context.validation.error_count(), 1);
    }

    #[test]
    fn empty_extent_is_rejected() {
        let result = SoftwareSwapchain::new(context(), &SwapchainDesc::new(NativeSurface::Headless, 0, 8));
        assert!(matches!(result, Err(RhiError::SwapchainCreation(_))));
    }
}
