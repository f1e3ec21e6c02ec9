//! Command queues.
//!
//! Every queue owns a private timeline semaphore that counts its
//! submissions, so command lists can tell when the GPU is done with them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use prism_core::command::{CommandList, CommandListState, CommandListType, CommandQueue};
use prism_core::fence::Fence;
use prism_core::interface::cast_arc;
use prism_core::{impl_query_interface, require, Result};

use crate::command_list::VulkanCommandList;
use crate::context::DeviceContext;
use crate::error::VulkanError;
use crate::fence::{create_timeline_semaphore, VulkanFence};

/// Submission counter of one queue.
pub struct QueueProgress {
    context: Arc<DeviceContext>,
    semaphore: vk::Semaphore,
    submitted: AtomicU64,
}

impl QueueProgress {
    fn new(context: &Arc<DeviceContext>) -> Result<Arc<Self>> {
        let semaphore = unsafe { create_timeline_semaphore(&context.device, 0) }?;
        Ok(Arc::new(Self {
            context: Arc::clone(context),
            semaphore,
            submitted: AtomicU64::new(0),
        }))
    }

    /// Only called under the queue lock.
    fn pending(&self) -> u64 {
        self.submitted.load(Ordering::Acquire) + 1
    }

    /// Whether the submission numbered `value` has finished. A lost device
    /// finishes everything.
    pub fn is_complete(&self, value: u64) -> bool {
        unsafe { self.context.device.get_semaphore_counter_value(self.semaphore) }
            .map_or(true, |completed| completed >= value)
    }

    pub fn wait(&self, value: u64) {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        if let Err(e) = unsafe { self.context.device.wait_semaphores(&wait_info, u64::MAX) } {
            tracing::warn!("Failed to wait for queue submission {value}: {e}");
        }
    }
}

impl Drop for QueueProgress {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_semaphore(self.semaphore, None) };
    }
}

pub struct VulkanCommandQueue {
    context: Arc<DeviceContext>,
    queue_type: CommandListType,
    family: u32,
    progress: Arc<QueueProgress>,
}

impl_query_interface!(VulkanCommandQueue);

fn vulkan_fence(fence: &Arc<dyn Fence>) -> Arc<VulkanFence> {
    cast_arc::<VulkanFence>(Arc::clone(fence).into_any())
}

fn semaphore_info(semaphore: vk::Semaphore, value: u64) -> vk::SemaphoreSubmitInfo<'static> {
    vk::SemaphoreSubmitInfo::default()
        .semaphore(semaphore)
        .value(value)
        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
}

impl VulkanCommandQueue {
    pub fn new(context: &Arc<DeviceContext>, queue_type: CommandListType) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            context: Arc::clone(context),
            queue_type,
            family: context.queue_family(queue_type),
            progress: QueueProgress::new(context)?,
        }))
    }

    const fn accepts(&self, list_type: CommandListType) -> bool {
        match self.queue_type {
            CommandListType::Graphics => true,
            CommandListType::Compute => !matches!(list_type, CommandListType::Graphics),
            CommandListType::Copy => matches!(list_type, CommandListType::Copy),
        }
    }

    /// Submit under the queue lock; queues of one family share a `vk::Queue`.
    fn submit(&self, submit: &vk::SubmitInfo2<'_>) -> Result<()> {
        let slot = self.context.queue_slot(self.family);
        let _guard = slot.lock.lock();
        unsafe {
            self.context
                .device
                .queue_submit2(slot.queue, std::slice::from_ref(submit), vk::Fence::null())
        }
        .map_err(VulkanError::from)?;
        Ok(())
    }

    /// Block until everything submitted so far has executed.
    pub(crate) fn flush(&self) {
        self.progress.wait(self.progress.submitted.load(Ordering::Acquire));
    }
}

impl CommandQueue for VulkanCommandQueue {
    fn queue_type(&self) -> CommandListType {
        self.queue_type
    }

    fn wait(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<()> {
        let fence = vulkan_fence(fence);
        let waits = [semaphore_info(fence.native(), value)];
        self.submit(&vk::SubmitInfo2::default().wait_semaphore_infos(&waits))
    }

    fn signal(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<()> {
        let fence = vulkan_fence(fence);
        fence.request(value);
        let signals = [semaphore_info(fence.native(), value)];
        self.submit(&vk::SubmitInfo2::default().signal_semaphore_infos(&signals))
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn execute_command_lists(&self, command_lists: &[Arc<dyn CommandList>]) -> Result<()> {
        let mut lists = Vec::with_capacity(command_lists.len());
        for list in command_lists {
            let list = cast_arc::<VulkanCommandList>(Arc::clone(list).into_any());
            require!(
                list.state() == CommandListState::Closed,
                "command list '{}' submitted while still recording",
                list.name()
            );
            require!(
                self.accepts(list.list_type()),
                "{:?} command list submitted to a {:?} queue",
                list.list_type(),
                self.queue_type
            );
            require!(
                list.family() == self.family,
                "command list '{}' was recorded for queue family {} but submitted to family {}",
                list.name(),
                list.family(),
                self.family
            );
            lists.push(list);
        }
        let command_buffers: Vec<vk::CommandBufferSubmitInfo> = lists
            .iter()
            .map(|list| vk::CommandBufferSubmitInfo::default().command_buffer(list.native()))
            .collect();

        let slot = self.context.queue_slot(self.family);
        let _guard = slot.lock.lock();
        let value = self.progress.pending();
        let signals = [semaphore_info(self.progress.semaphore, value)];
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.context
                .device
                .queue_submit2(slot.queue, &[submit], vk::Fence::null())
        }
        .map_err(VulkanError::from)?;
        self.progress.submitted.store(value, Ordering::Release);
        for list in &lists {
            list.begin_execution(&self.progress, value);
        }
        tracing::trace!(queue = ?self.queue_type, lists = lists.len(), value, "Command lists submitted");
        Ok(())
    }
}
