//! CPU-visible timeline fences.

use std::sync::Weak;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use prism_core::fence::{Fence, SignalTracker};
use prism_core::{impl_query_interface, Result, RhiError};

use crate::queue::Scheduler;

pub struct SoftwareFence {
    completed: Mutex<u64>,
    reached: Condvar,
    requested: SignalTracker,
    timeout: Duration,
    scheduler: Weak<Scheduler>,
}

impl_query_interface!(SoftwareFence);

impl SoftwareFence {
    pub fn new(initial_value: u64, timeout: Duration, scheduler: Weak<Scheduler>) -> Self {
        Self {
            completed: Mutex::new(initial_value),
            reached: Condvar::new(),
            requested: SignalTracker::new(initial_value),
            timeout,
            scheduler,
        }
    }

    /// Record a signal a queue will perform later.
    pub(crate) fn request(&self, value: u64) {
        self.requested.advance(value);
    }

    /// Highest value requested so far, by the CPU or a queue.
    pub fn last_requested(&self) -> u64 {
        self.requested.last()
    }

    /// Raise the completed value and wake everything waiting on it.
    pub(crate) fn complete(&self, value: u64) {
        {
            let mut completed = self.completed.lock();
            *completed = (*completed).max(value);
        }
        self.reached.notify_all();
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.pump();
        }
    }
}

impl Fence for SoftwareFence {
    fn completed_value(&self) -> u64 {
        *self.completed.lock()
    }

    fn wait(&self, value: u64) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut completed = self.completed.lock();
        while *completed < value {
            if self.reached.wait_until(&mut completed, deadline).timed_out() && *completed < value {
                tracing::warn!(value, completed = *completed, "Fence wait timed out");
                return Err(RhiError::Timeout(value));
            }
        }
        Ok(())
    }

    fn signal(&self, value: u64) -> Result<()> {
        self.requested.advance(value);
        self.complete(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fence(initial: u64) -> Arc<SoftwareFence> {
        Arc::new(SoftwareFence::new(initial, Duration::from_millis(50), Weak::new()))
    }

    #[test]
    fn cpu_signal_completes_immediately() {
        let fence = fence(3);
        assert_eq!(fence.completed_value(), 3);
        fence.signal(5).unwrap();
        assert_eq!(fence.completed_value(), 5);
        fence.wait(4).unwrap();
    }

    #[test]
    fn wait_for_unsignaled_value_times_out() {
        let fence = fence(0);
        assert!(matches!(fence.wait(1), Err(RhiError::Timeout(1))));
    }

    #[test]
    fn wait_wakes_on_signal_from_another_thread() {
        let fence = Arc::new(SoftwareFence::new(0, Duration::from_secs(5), Weak::new()));
        let signaler = Arc::clone(&fence);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.signal(1).unwrap();
        });
        fence.wait(1).unwrap();
        assert_eq!(fence.completed_value(), 1);
        handle.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "must not decrease")]
    fn decreasing_signal_is_fatal() {
        let fence = fence(0);
        fence.signal(4).unwrap();
        fence.signal(2).unwrap();
    }
}
