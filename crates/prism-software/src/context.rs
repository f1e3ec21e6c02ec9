//! State shared by a software device and every object it creates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use prism_core::validation::{Severity, ValidationFilter};

use crate::config::SoftwareDeviceConfig;
use crate::descriptor::DescriptorHeaps;
use crate::memory::MemoryAccounting;
use crate::resource::SoftwareResource;

/// Work counters of one device.
#[derive(Debug, Default)]
pub struct DeviceStats {
    draws: AtomicU64,
    dispatches: AtomicU64,
    transitions: AtomicU64,
    clears: AtomicU64,
    copies: AtomicU64,
    builds: AtomicU64,
    submissions: AtomicU64,
}

/// Point-in-time copy of [`DeviceStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub draws: u64,
    pub dispatches: u64,
    /// Barriers that changed a state; elided barriers are not counted.
    pub transitions: u64,
    pub clears: u64,
    pub copies: u64,
    pub builds: u64,
    pub submissions: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Draw,
    Dispatch,
    Transition,
    Clear,
    Copy,
    Build,
    Submission,
}

impl DeviceStats {
    pub(crate) fn add(&self, counter: Counter, count: u64) {
        let target = match counter {
            Counter::Draw => &self.draws,
            Counter::Dispatch => &self.dispatches,
            Counter::Transition => &self.transitions,
            Counter::Clear => &self.clears,
            Counter::Copy => &self.copies,
            Counter::Build => &self.builds,
            Counter::Submission => &self.submissions,
        };
        target.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            draws: self.draws.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
        }
    }
}

pub struct DeviceContext {
    pub config: SoftwareDeviceConfig,
    pub accounting: Arc<MemoryAccounting>,
    pub heaps: DescriptorHeaps,
    pub validation: Arc<ValidationFilter>,
    pub stats: DeviceStats,
    next_id: AtomicU64,
    acceleration_structures: Mutex<HashMap<u64, Weak<SoftwareResource>>>,
}

impl DeviceContext {
    pub fn new(config: SoftwareDeviceConfig, validation: Arc<ValidationFilter>) -> Arc<Self> {
        Arc::new(Self {
            accounting: Arc::new(MemoryAccounting::new(config.memory_budget)),
            heaps: DescriptorHeaps::new(config.binding_model),
            config,
            validation,
            stats: DeviceStats::default(),
            next_id: AtomicU64::new(1),
            acceleration_structures: Mutex::new(HashMap::new()),
        })
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_acceleration_structure(&self, resource: &Arc<SoftwareResource>) {
        let mut registry = self.acceleration_structures.lock();
        registry.retain(|_, entry| entry.strong_count() > 0);
        registry.insert(resource.acceleration_structure_handle_value(), Arc::downgrade(resource));
    }

    /// Look up a live acceleration structure by the handle instance records
    /// carry.
    pub fn resolve_acceleration_structure(&self, handle: u64) -> Option<Arc<SoftwareResource>> {
        self.acceleration_structures.lock().get(&handle).and_then(Weak::upgrade)
    }

    /// Report a GPU-side usage error found while executing work.
    pub fn report_error(&self, message: &str) {
        self.validation.report(Severity::Error, message);
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("binding_model", &self.config.binding_model)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
