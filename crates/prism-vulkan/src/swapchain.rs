//! Swapchain management.
//!
//! Acquire and present use binary semaphores; each is bridged to the
//! caller's timeline fence with a small submission on the graphics queue.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use prism_core::fence::Fence;
use prism_core::format::Format;
use prism_core::interface::cast_arc;
use prism_core::resource::{BindFlag, Resource, TextureDesc};
use prism_core::retain::RetainList;
use prism_core::swapchain::{NativeSurface, Swapchain, SwapchainDesc};
use prism_core::{impl_query_interface, require, Result, RhiError};

use crate::context::DeviceContext;
use crate::error::VulkanError;
use crate::fence::VulkanFence;
use crate::format::from_vk_format;
use crate::resource::VulkanResource;

/// Select the best surface format among those prism can name.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    // Prefer SRGB
    let preferred = available.iter().find(|format| {
        format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    preferred
        .or_else(|| available.iter().find(|format| from_vk_format(format.format).is_some()))
        .copied()
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let preferences: &[vk::PresentModeKHR] = if vsync {
        &[vk::PresentModeKHR::FIFO_RELAXED]
    } else {
        &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
    };
    preferences
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

struct FrameState {
    current: u32,
    next_acquire: usize,
    /// Fences referenced by bridge submissions still in flight.
    retained: RetainList,
}

pub struct VulkanSwapchain {
    context: Arc<DeviceContext>,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    format: Format,
    back_buffers: Vec<Arc<VulkanResource>>,
    acquire_semaphores: Vec<vk::Semaphore>,
    /// One per back buffer, signaled before it is presented.
    present_semaphores: Vec<vk::Semaphore>,
    frame: Mutex<FrameState>,
}

impl_query_interface!(VulkanSwapchain);

fn vulkan_fence(fence: &Arc<dyn Fence>) -> Arc<VulkanFence> {
    cast_arc::<VulkanFence>(Arc::clone(fence).into_any())
}

impl VulkanSwapchain {
    pub fn new(context: &Arc<DeviceContext>, desc: &SwapchainDesc) -> Result<Arc<Self>> {
        let NativeSurface::Window { display, window } = desc.surface else {
            return Err(RhiError::SurfaceCreation(
                "Vulkan swapchains need a window surface".to_string(),
            ));
        };
        let shared = &context.instance;
        let surface = unsafe {
            ash_window::create_surface(&shared.entry, &shared.instance, display, window, None)
        }
        .map_err(|e| RhiError::SurfaceCreation(e.to_string()))?;

        let mut swapchain = Self {
            context: Arc::clone(context),
            surface,
            swapchain: vk::SwapchainKHR::null(),
            format: Format::Undefined,
            back_buffers: Vec::new(),
            acquire_semaphores: Vec::new(),
            present_semaphores: Vec::new(),
            frame: Mutex::new(FrameState {
                current: 0,
                next_acquire: 0,
                retained: RetainList::new(),
            }),
        };
        // Dropping `swapchain` on error releases whatever exists so far.
        swapchain.create(desc)?;
        Ok(Arc::new(swapchain))
    }

    fn create(&mut self, desc: &SwapchainDesc) -> Result<()> {
        let context = Arc::clone(&self.context);
        let surface_loader = &context.instance.surface_loader;
        let physical_device = context.physical_device;
        let family = context.queue_families.graphics;

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(physical_device, family, self.surface)
        }
        .map_err(VulkanError::from)?;
        if !supported {
            return Err(RhiError::SurfaceCreation(
                "the graphics queue cannot present to this surface".to_string(),
            ));
        }
        let (capabilities, formats, present_modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)
                    .map_err(VulkanError::from)?,
                surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)
                    .map_err(VulkanError::from)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)
                    .map_err(VulkanError::from)?,
            )
        };

        let surface_format = select_surface_format(&formats).ok_or_else(|| {
            RhiError::SwapchainCreation("the surface offers no usable color format".to_string())
        })?;
        let Some(format) = from_vk_format(surface_format.format) else {
            return Err(RhiError::SwapchainCreation(format!(
                "unsupported surface format {:?}",
                surface_format.format
            )));
        };
        let present_mode = select_present_mode(&present_modes, desc.vsync);
        let extent = calculate_extent(&capabilities, desc.width, desc.height);

        let queue_families = [family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count(&capabilities, desc.frame_count))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        let loader = &context.swapchain_loader;
        self.swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| RhiError::SwapchainCreation(e.to_string()))?;
        self.format = format;

        let images = unsafe { loader.get_swapchain_images(self.swapchain) }.map_err(VulkanError::from)?;
        let texture_desc = TextureDesc::new_2d(
            format,
            extent.width,
            extent.height,
            BindFlag::RENDER_TARGET | BindFlag::COPY_DEST,
        );
        self.back_buffers = images
            .iter()
            .enumerate()
            .map(|(index, &image)| {
                let back_buffer = VulkanResource::new_back_buffer(&context, &texture_desc, image);
                back_buffer.set_name(&format!("back buffer {index}"));
                back_buffer
            })
            .collect();

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for _ in 0..=images.len() {
            let semaphore = unsafe { context.device.create_semaphore(&semaphore_info, None) }
                .map_err(VulkanError::from)?;
            self.acquire_semaphores.push(semaphore);
        }
        for _ in 0..images.len() {
            let semaphore = unsafe { context.device.create_semaphore(&semaphore_info, None) }
                .map_err(VulkanError::from)?;
            self.present_semaphores.push(semaphore);
        }

        // Back buffers start presentable.
        context.execute_single_time_commands(|cmd| {
            let barriers: Vec<vk::ImageMemoryBarrier2> = images
                .iter()
                .map(|&image| {
                    vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(image)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                })
                .collect();
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { context.device.cmd_pipeline_barrier2(cmd, &dependency) };
        })?;

        tracing::info!(
            width = extent.width,
            height = extent.height,
            images = images.len(),
            format = ?format,
            present_mode = ?present_mode,
            "Swapchain created"
        );
        Ok(())
    }

    fn submit(&self, submit: &vk::SubmitInfo2<'_>) -> Result<()> {
        let slot = self.context.queue_slot(self.context.queue_families.graphics);
        let _guard = slot.lock.lock();
        unsafe {
            self.context
                .device
                .queue_submit2(slot.queue, std::slice::from_ref(submit), vk::Fence::null())
        }
        .map_err(VulkanError::from)?;
        Ok(())
    }
}

impl Swapchain for VulkanSwapchain {
    fn format(&self) -> Format {
        self.format
    }

    fn frame_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    fn back_buffer(&self, index: u32) -> Arc<dyn Resource> {
        require!(
            (index as usize) < self.back_buffers.len(),
            "back buffer {index} requested from a swapchain of {}",
            self.back_buffers.len()
        );
        Arc::clone(&self.back_buffers[index as usize]) as Arc<dyn Resource>
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn next_image(&self, fence: &Arc<dyn Fence>, signal_value: u64) -> Result<u32> {
        let vulkan_fence = vulkan_fence(fence);
        let mut frame = self.frame.lock();
        let semaphore = self.acquire_semaphores[frame.next_acquire];

        let result = unsafe {
            self.context.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        let index = match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    tracing::debug!("Swapchain is suboptimal for its surface");
                }
                index
            }
            // No image was acquired; the swapchain must be recreated.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                return Err(RhiError::InvalidState("swapchain is out of date".to_string()));
            }
            Err(e) => return Err(VulkanError::from(e).into()),
        };

        vulkan_fence.request(signal_value);
        let waits = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(vulkan_fence.native())
            .value(signal_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        self.submit(
            &vk::SubmitInfo2::default()
                .wait_semaphore_infos(&waits)
                .signal_semaphore_infos(&signals),
        )?;

        frame.retained.retain(signal_value, vulkan_fence);
        frame.current = index;
        frame.next_acquire = (frame.next_acquire + 1) % self.acquire_semaphores.len();
        Ok(index)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn present(&self, fence: &Arc<dyn Fence>, wait_value: u64) -> Result<()> {
        let vulkan_fence = vulkan_fence(fence);
        let mut frame = self.frame.lock();
        let index = frame.current;
        let semaphore = self.present_semaphores[index as usize];

        let waits = [vk::SemaphoreSubmitInfo::default()
            .semaphore(vulkan_fence.native())
            .value(wait_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        self.submit(
            &vk::SubmitInfo2::default()
                .wait_semaphore_infos(&waits)
                .signal_semaphore_infos(&signals),
        )?;

        let swapchains = [self.swapchain];
        let image_indices = [index];
        let wait_semaphores = [semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let slot = self.context.queue_slot(self.context.queue_families.graphics);
        let result = {
            let _guard = slot.lock.lock();
            unsafe { self.context.swapchain_loader.queue_present(slot.queue, &present_info) }
        };
        match result {
            Ok(false) => {}
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::debug!("Swapchain needs recreation after present");
            }
            Err(e) => return Err(VulkanError::from(e).into()),
        }

        let completed = vulkan_fence.completed_value();
        frame.retained.retain(wait_value, vulkan_fence);
        frame.retained.release_completed(completed);
        Ok(())
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        let slot = self.context.queue_slot(self.context.queue_families.graphics);
        {
            let _guard = slot.lock.lock();
            if let Err(e) = unsafe { self.context.device.queue_wait_idle(slot.queue) } {
                tracing::warn!("Failed to drain the graphics queue: {e}");
            }
        }
        self.frame.get_mut().retained.clear();
        self.back_buffers.clear();
        unsafe {
            for &semaphore in self.acquire_semaphores.iter().chain(&self.present_semaphores) {
                self.context.device.destroy_semaphore(semaphore, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.context.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.context
                .instance
                .surface_loader
                .destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_prefers_relaxed_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(select_present_mode(&available, true), vk::PresentModeKHR::FIFO_RELAXED);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], true),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn no_vsync_prefers_mailbox_then_immediate() {
        let available = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&available, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&available[..2], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            select_present_mode(&available[..1], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            ..unorm
        };
        assert_eq!(select_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(select_surface_format(&[unorm]), Some(unorm));
        let unknown = vk::SurfaceFormatKHR {
            format: vk::Format::A2B10G10R10_UNORM_PACK32,
            ..unorm
        };
        assert_eq!(select_surface_format(&[unknown]), None);
    }

    #[test]
    fn extent_follows_the_surface_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&capabilities, 1024, 768);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn image_count_is_clamped() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(image_count(&capabilities, 1), 2);
        assert_eq!(image_count(&capabilities, 5), 3);
        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&unbounded, 8), 8);
    }
}
