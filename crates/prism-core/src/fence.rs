//! Monotonic fences.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::interface::QueryInterface;

/// A monotonically increasing 64-bit counter shared by the CPU and queues.
pub trait Fence: QueryInterface {
    fn completed_value(&self) -> u64;

    /// Block the calling thread until the completed value reaches `value`.
    fn wait(&self, value: u64) -> Result<()>;

    /// Set the counter from the CPU.
    fn signal(&self, value: u64) -> Result<()>;
}

/// Last value requested from a fence, enforcing non-decreasing signals.
#[derive(Debug, Default)]
pub struct SignalTracker {
    last: AtomicU64,
}

impl SignalTracker {
    pub const fn new(initial: u64) -> Self {
        Self {
            last: AtomicU64::new(initial),
        }
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Record a new signal value. A value below the previous one is a
    /// contract violation.
    pub fn advance(&self, value: u64) {
        let previous = self.last.fetch_max(value, Ordering::AcqRel);
        crate::require!(
            value >= previous,
            "fence signaled with {value} after {previous}; fence values must not decrease"
        );
    }
}

/// Highest completed value a backend has read back. Completion never moves
/// backwards, so this stays a valid answer when a later read fails.
#[derive(Debug)]
pub struct CompletedValue {
    last: AtomicU64,
}

impl CompletedValue {
    pub const fn new(initial: u64) -> Self {
        Self {
            last: AtomicU64::new(initial),
        }
    }

    /// Record a value read from the backend and return the highest seen.
    pub fn observe(&self, value: u64) -> u64 {
        self.last.fetch_max(value, Ordering::AcqRel).max(value)
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_are_allowed() {
        let tracker = SignalTracker::new(0);
        tracker.advance(1);
        tracker.advance(1);
        tracker.advance(5);
        assert_eq!(tracker.last(), 5);
    }

    #[test]
    fn completed_value_survives_a_failed_read() {
        let completed = CompletedValue::new(2);
        assert_eq!(completed.observe(7), 7);
        assert_eq!(completed.observe(4), 7);
        assert_eq!(completed.last(), 7);
    }

    #[test]
    #[should_panic(expected = "must not decrease")]
    fn decreasing_value_is_fatal() {
        let tracker = SignalTracker::new(3);
        tracker.advance(2);
    }
}
