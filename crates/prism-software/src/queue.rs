//! Command queues and the device-wide scheduler that runs them.
//!
//! Work runs on the thread that submits it. A queue whose front operation
//! waits on an unsignaled fence stalls until some thread signals that
//! fence, at which point the signaling thread drives the stalled queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use prism_core::command::{CommandList, CommandListState, CommandListType, CommandQueue};
use prism_core::fence::Fence;
use prism_core::interface::cast_arc;
use prism_core::{impl_query_interface, require, Result, RhiError};

use crate::command_list::SoftwareCommandList;
use crate::context::{Counter, DeviceContext};
use crate::fence::SoftwareFence;

enum QueueOp {
    Wait { fence: Arc<SoftwareFence>, value: u64 },
    Execute(Vec<Arc<SoftwareCommandList>>),
    Signal { fence: Arc<SoftwareFence>, value: u64 },
}

impl QueueOp {
    fn is_ready(&self) -> bool {
        match self {
            Self::Wait { fence, value } => fence.completed_value() >= *value,
            Self::Execute(_) | Self::Signal { .. } => true,
        }
    }
}

pub struct Scheduler {
    context: Arc<DeviceContext>,
    queues: Mutex<BTreeMap<CommandListType, VecDeque<QueueOp>>>,
    drained: Condvar,
    pumping: AtomicBool,
    dirty: AtomicBool,
}

impl Scheduler {
    pub fn new(context: Arc<DeviceContext>) -> Arc<Self> {
        Arc::new(Self {
            context,
            queues: Mutex::new(BTreeMap::new()),
            drained: Condvar::new(),
            pumping: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        })
    }

    fn enqueue(&self, queue_type: CommandListType, op: QueueOp) {
        self.queues.lock().entry(queue_type).or_default().push_back(op);
        self.pump();
    }

    /// Run every operation whose dependencies are met.
    ///
    /// Only one thread pumps at a time; a pump requested meanwhile marks the
    /// scheduler dirty and the active pump goes around again.
    pub fn pump(&self) {
        loop {
            if self.pumping.swap(true, Ordering::AcqRel) {
                self.dirty.store(true, Ordering::Release);
                return;
            }
            loop {
                self.dirty.store(false, Ordering::Release);
                while let Some(op) = self.next_ready() {
                    self.run(op);
                }
                if !self.dirty.load(Ordering::Acquire) {
                    break;
                }
            }
            self.pumping.store(false, Ordering::Release);
            {
                let _queues = self.queues.lock();
                self.drained.notify_all();
            }
            if !self.dirty.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn next_ready(&self) -> Option<QueueOp> {
        let mut queues = self.queues.lock();
        queues
            .values_mut()
            .find(|queue| queue.front().is_some_and(QueueOp::is_ready))
            .and_then(VecDeque::pop_front)
    }

    fn run(&self, op: QueueOp) {
        match op {
            QueueOp::Wait { .. } => {}
            QueueOp::Execute(lists) => {
                for list in lists {
                    list.execute(&self.context);
                }
                self.context.stats.add(Counter::Submission, 1);
            }
            QueueOp::Signal { fence, value } => fence.complete(value),
        }
    }

    fn pending(queues: &BTreeMap<CommandListType, VecDeque<QueueOp>>) -> usize {
        queues.values().map(VecDeque::len).sum()
    }

    /// Block until every queue has drained.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        self.pump();
        let deadline = Instant::now() + timeout;
        let mut queues = self.queues.lock();
        while Self::pending(&queues) > 0 || self.pumping.load(Ordering::Acquire) {
            if self.drained.wait_until(&mut queues, deadline).timed_out() {
                let pending = Self::pending(&queues);
                if pending > 0 {
                    return Err(RhiError::InvalidState(format!(
                        "{pending} queued operations are blocked on fences that were never signaled"
                    )));
                }
            }
        }
        Ok(())
    }
}

pub struct SoftwareCommandQueue {
    queue_type: CommandListType,
    scheduler: Arc<Scheduler>,
}

impl_query_interface!(SoftwareCommandQueue);

impl SoftwareCommandQueue {
    pub const fn new(queue_type: CommandListType, scheduler: Arc<Scheduler>) -> Self {
        Self {
            queue_type,
            scheduler,
        }
    }

    const fn accepts(&self, list_type: CommandListType) -> bool {
        match self.queue_type {
            CommandListType::Graphics => true,
            CommandListType::Compute => !matches!(list_type, CommandListType::Graphics),
            CommandListType::Copy => matches!(list_type, CommandListType::Copy),
        }
    }
}

fn software_fence(fence: &Arc<dyn Fence>) -> Arc<SoftwareFence> {
    cast_arc::<SoftwareFence>(Arc::clone(fence).into_any())
}

impl CommandQueue for SoftwareCommandQueue {
    fn queue_type(&self) -> CommandListType {
        self.queue_type
    }

    fn wait(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<()> {
        let fence = software_fence(fence);
        self.scheduler.enqueue(self.queue_type, QueueOp::Wait { fence, value });
        Ok(())
    }

    fn signal(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<()> {
        let fence = software_fence(fence);
        fence.request(value);
        self.scheduler.enqueue(self.queue_type, QueueOp::Signal { fence, value });
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn execute_command_lists(&self, command_lists: &[Arc<dyn CommandList>]) -> Result<()> {
        let mut lists = Vec::with_capacity(command_lists.len());
        for list in command_lists {
            let list = cast_arc::<SoftwareCommandList>(Arc::clone(list).into_any());
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
            list.begin_execution();
            lists.push(list);
        }
        tracing::trace!(queue = ?self.queue_type, lists = lists.len(), "Command lists submitted");
        self.scheduler.enqueue(self.queue_type, QueueOp::Execute(lists));
        Ok(())
    }
}
