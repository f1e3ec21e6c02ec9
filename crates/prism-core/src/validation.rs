//! Filtering of validation-layer and backend diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::config::ValidationFilterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Default)]
struct FilterState {
    seen_prefixes: HashSet<String>,
    logged: usize,
    suppressed: u64,
}

/// Deduplicating, rate-limited sink for diagnostics.
///
/// Every error is counted, even when its message is muted by deduplication
/// or the message cap, so tests can assert that nothing went wrong.
#[derive(Debug)]
pub struct ValidationFilter {
    config: ValidationFilterConfig,
    state: Mutex<FilterState>,
    error_count: AtomicU64,
    warning_count: AtomicU64,
}

impl ValidationFilter {
    pub fn new(config: ValidationFilterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FilterState::default()),
            error_count: AtomicU64::new(0),
            warning_count: AtomicU64::new(0),
        }
    }

    pub const fn config(&self) -> &ValidationFilterConfig {
        &self.config
    }

    /// Submit one message. Returns whether it was logged.
    pub fn report(&self, severity: Severity, message: &str) -> bool {
        if self.is_muted(message) {
            return false;
        }
        match severity {
            Severity::Error => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
            Severity::Warning => {
                self.warning_count.fetch_add(1, Ordering::Relaxed);
            }
            Severity::Verbose | Severity::Info => {}
        }

        let mut state = self.state.lock();
        if state.logged >= self.config.max_messages {
            state.suppressed += 1;
            return false;
        }
        let prefix = truncate_at_char_boundary(message, self.config.dedup_prefix_len);
        if !state.seen_prefixes.insert(prefix.to_owned()) {
            return false;
        }
        state.logged += 1;
        let reached_cap = state.logged == self.config.max_messages;
        drop(state);

        match severity {
            Severity::Error => tracing::error!(target: "prism::validation", "{message}"),
            Severity::Warning => tracing::warn!(target: "prism::validation", "{message}"),
            Severity::Info => tracing::info!(target: "prism::validation", "{message}"),
            Severity::Verbose => tracing::debug!(target: "prism::validation", "{message}"),
        }
        if reached_cap {
            tracing::warn!(
                target: "prism::validation",
                "Validation message limit of {} reached; further messages are dropped",
                self.config.max_messages
            );
        }
        true
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn warning_count(&self) -> u64 {
        self.warning_count.load(Ordering::Relaxed)
    }

    /// Messages dropped because the cap was reached.
    pub fn suppressed_count(&self) -> u64 {
        self.state.lock().suppressed
    }

    fn is_muted(&self, message: &str) -> bool {
        self.config.muted_ids.iter().any(|id| message.contains(id.as_str()))
    }
}

impl Default for ValidationFilter {
    fn default() -> Self {
        Self::new(ValidationFilterConfig::default())
    }
}

fn truncate_at_char_boundary(message: &str, len: usize) -> &str {
    if message.len() <= len {
        return message;
    }
    let mut end = len;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_share_a_prefix() {
        let filter = ValidationFilter::new(ValidationFilterConfig::default().with_dedup_prefix_len(8));
        assert!(filter.report(Severity::Warning, "barrier mismatch on texture 1"));
        assert!(!filter.report(Severity::Warning, "barrier mismatch on texture 2"));
        assert!(filter.report(Severity::Warning, "another message"));
        assert_eq!(filter.warning_count(), 3);
    }

    #[test]
    fn muted_ids_are_dropped_and_not_counted() {
        let filter = ValidationFilter::new(ValidationFilterConfig::default().with_muted_id("VUID-test-0001"));
        assert!(!filter.report(Severity::Error, "Validation Error: [ VUID-test-0001 ] bad"));
        assert_eq!(filter.error_count(), 0);
    }

    #[test]
    fn cap_stops_logging_but_keeps_counting() {
        let filter = ValidationFilter::new(ValidationFilterConfig::default().with_max_messages(2));
        assert!(filter.report(Severity::Error, "first"));
        assert!(filter.report(Severity::Error, "second"));
        assert!(!filter.report(Severity::Error, "third"));
        assert_eq!(filter.error_count(), 3);
        assert_eq!(filter.suppressed_count(), 1);
    }

    #[test]
    fn prefix_respects_utf8_boundaries() {
        assert_eq!(truncate_at_char_boundary("héllo", 2), "h");
        assert_eq!(truncate_at_char_boundary("abc", 8), "abc");
    }
}
