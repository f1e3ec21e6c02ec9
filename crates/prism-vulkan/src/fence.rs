//! Fences on timeline semaphores.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use prism_core::fence::{CompletedValue, Fence, SignalTracker};
use prism_core::{impl_query_interface, Result, RhiError};

use crate::context::DeviceContext;
use crate::error::VulkanError;

/// How long a CPU wait may block before reporting a timeout.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) unsafe fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> std::result::Result<vk::Semaphore, VulkanError> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    Ok(unsafe { device.create_semaphore(&create_info, None) }?)
}

pub struct VulkanFence {
    context: Arc<DeviceContext>,
    semaphore: vk::Semaphore,
    requested: SignalTracker,
    completed: CompletedValue,
}

impl_query_interface!(VulkanFence);

impl VulkanFence {
    pub fn new(context: &Arc<DeviceContext>, initial_value: u64) -> Result<Arc<Self>> {
        let semaphore = unsafe { create_timeline_semaphore(&context.device, initial_value) }?;
        Ok(Arc::new(Self {
            context: Arc::clone(context),
            semaphore,
            requested: SignalTracker::new(initial_value),
            completed: CompletedValue::new(initial_value),
        }))
    }

    pub const fn native(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Record a signal a queue will perform later.
    pub(crate) fn request(&self, value: u64) {
        self.requested.advance(value);
    }
}

impl Fence for VulkanFence {
    fn completed_value(&self) -> u64 {
        match unsafe { self.context.device.get_semaphore_counter_value(self.semaphore) } {
            Ok(value) => self.completed.observe(value),
            Err(e) => {
                let last = self.completed.last();
                tracing::error!(last, "Failed to read fence value: {e}");
                last
            }
        }
    }

    fn wait(&self, value: u64) -> Result<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout = u64::try_from(WAIT_TIMEOUT.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.context.device.wait_semaphores(&wait_info, timeout) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                tracing::warn!(value, completed = self.completed_value(), "Fence wait timed out");
                Err(RhiError::Timeout(value))
            }
            Err(e) => Err(VulkanError::from(e).into()),
        }
    }

    fn signal(&self, value: u64) -> Result<()> {
        self.requested.advance(value);
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.semaphore)
            .value(value);
        unsafe { self.context.device.signal_semaphore(&signal_info) }.map_err(VulkanError::from)?;
        Ok(())
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_semaphore(self.semaphore, None) };
    }
}
