//! Logical resource states, barrier requests and per-subresource tracking.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::resource::Resource;

bitflags! {
    /// Access mode a resource is currently compatible with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ResourceState: u32 {
        const COMMON = 1 << 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const DEPTH_STENCIL_WRITE = 1 << 5;
        const DEPTH_STENCIL_READ = 1 << 6;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 7;
        const PIXEL_SHADER_RESOURCE = 1 << 8;
        const INDIRECT_ARGUMENT = 1 << 9;
        const COPY_DEST = 1 << 10;
        const COPY_SOURCE = 1 << 11;
        const RAYTRACING_ACCELERATION_STRUCTURE = 1 << 12;
        const SHADING_RATE_SOURCE = 1 << 13;
        const PRESENT = 1 << 14;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::COPY_SOURCE.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits();
        const UNDEFINED = 1 << 15;
    }
}

impl ResourceState {
    /// The empty state, used before a resource has been given any state.
    pub const UNKNOWN: Self = Self::empty();
}

/// A state transition request over a subresource range.
#[derive(Clone)]
pub struct ResourceBarrierDesc {
    pub resource: Arc<dyn Resource>,
    pub state_before: ResourceState,
    pub state_after: ResourceState,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ResourceBarrierDesc {
    /// Transition of the first mip level of the first array layer.
    pub fn new(
        resource: &Arc<dyn Resource>,
        state_before: ResourceState,
        state_after: ResourceState,
    ) -> Self {
        Self {
            resource: Arc::clone(resource),
            state_before,
            state_after,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Transition of every subresource.
    pub fn whole(
        resource: &Arc<dyn Resource>,
        state_before: ResourceState,
        state_after: ResourceState,
    ) -> Self {
        let level_count = u32::from(resource.level_count());
        let layer_count = u32::from(resource.layer_count());
        Self {
            level_count,
            layer_count,
            ..Self::new(resource, state_before, state_after)
        }
    }

    pub const fn with_mips(mut self, base_mip_level: u32, level_count: u32) -> Self {
        self.base_mip_level = base_mip_level;
        self.level_count = level_count;
        self
    }

    pub const fn with_layers(mut self, base_array_layer: u32, layer_count: u32) -> Self {
        self.base_array_layer = base_array_layer;
        self.layer_count = layer_count;
        self
    }

    /// A barrier between identical states needs no native transition.
    pub fn is_elided(&self) -> bool {
        self.state_before == self.state_after
    }
}

impl std::fmt::Debug for ResourceBarrierDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBarrierDesc")
            .field("resource_type", &self.resource.resource_type())
            .field("state_before", &self.state_before)
            .field("state_after", &self.state_after)
            .field("mips", &(self.base_mip_level..self.base_mip_level + self.level_count))
            .field(
                "layers",
                &(self.base_array_layer..self.base_array_layer + self.layer_count),
            )
            .finish()
    }
}

/// Barriers that require a native transition, in submission order.
pub fn effective_barriers(
    barriers: &[ResourceBarrierDesc],
) -> impl Iterator<Item = &ResourceBarrierDesc> {
    barriers.iter().filter(|barrier| !barrier.is_elided())
}

/// A subresource whose tracked state did not match a barrier's `state_before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMismatch {
    pub mip_level: u32,
    pub array_layer: u32,
    pub expected: ResourceState,
    pub actual: ResourceState,
}

/// Per-subresource logical state of one resource.
///
/// Stored compactly: while every subresource shares a state only that state
/// is kept, and individual entries exist only after a partial transition.
#[derive(Debug, Clone)]
pub struct ResourceStateTracker {
    level_count: u32,
    layer_count: u32,
    resource_state: Option<ResourceState>,
    subresource_states: BTreeMap<(u32, u32), ResourceState>,
}

impl ResourceStateTracker {
    pub fn new(level_count: u32, layer_count: u32, initial: ResourceState) -> Self {
        Self {
            level_count: level_count.max(1),
            layer_count: layer_count.max(1),
            resource_state: Some(initial),
            subresource_states: BTreeMap::new(),
        }
    }

    /// The shared state, or `None` while subresources differ.
    pub const fn resource_state(&self) -> Option<ResourceState> {
        self.resource_state
    }

    pub fn set_resource_state(&mut self, state: ResourceState) {
        self.subresource_states.clear();
        self.resource_state = Some(state);
    }

    pub fn subresource_state(&self, mip_level: u32, array_layer: u32) -> ResourceState {
        match self.resource_state {
            Some(state) => state,
            None => self
                .subresource_states
                .get(&(mip_level, array_layer))
                .copied()
                .unwrap_or(ResourceState::UNKNOWN),
        }
    }

    pub fn set_subresource_state(&mut self, mip_level: u32, array_layer: u32, state: ResourceState) {
        if self.resource_state == Some(state) {
            return;
        }
        if let Some(shared) = self.resource_state.take() {
            for mip in 0..self.level_count {
                for layer in 0..self.layer_count {
                    self.subresource_states.insert((mip, layer), shared);
                }
            }
        }
        self.subresource_states.insert((mip_level, array_layer), state);
        self.collapse();
    }

    /// Apply a barrier, returning the subresources whose tracked state
    /// disagreed with `state_before`.
    pub fn apply(&mut self, barrier: &ResourceBarrierDesc) -> Vec<StateMismatch> {
        let mips = Self::clamp(barrier.base_mip_level, barrier.level_count, self.level_count);
        let layers = Self::clamp(barrier.base_array_layer, barrier.layer_count, self.layer_count);
        let mut mismatches = Vec::new();
        for mip_level in mips {
            for array_layer in layers.clone() {
                let actual = self.subresource_state(mip_level, array_layer);
                if actual != barrier.state_before {
                    mismatches.push(StateMismatch {
                        mip_level,
                        array_layer,
                        expected: barrier.state_before,
                        actual,
                    });
                }
                self.set_subresource_state(mip_level, array_layer, barrier.state_after);
            }
        }
        mismatches
    }

    fn clamp(base: u32, count: u32, limit: u32) -> std::ops::Range<u32> {
        let start = base.min(limit);
        let end = base.saturating_add(count).min(limit);
        start..end
    }

    fn collapse(&mut self) {
        let total = (self.level_count * self.layer_count) as usize;
        if self.subresource_states.len() != total {
            return;
        }
        let mut states = self.subresource_states.values();
        let Some(&first) = states.next() else {
            return;
        };
        if states.all(|&state| state == first) {
            self.subresource_states.clear();
            self.resource_state = Some(first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_read_is_union_of_read_states() {
        assert!(ResourceState::GENERIC_READ.contains(ResourceState::COPY_SOURCE));
        assert!(ResourceState::GENERIC_READ.contains(ResourceState::INDEX_BUFFER));
        assert!(!ResourceState::GENERIC_READ.contains(ResourceState::COPY_DEST));
        assert_eq!(ResourceState::PRESENT.bits(), 1 << 14);
    }

    #[test]
    fn partial_transition_splits_and_recollapses() {
        let mut tracker = ResourceStateTracker::new(2, 1, ResourceState::COMMON);
        tracker.set_subresource_state(1, 0, ResourceState::COPY_DEST);
        assert_eq!(tracker.resource_state(), None);
        assert_eq!(tracker.subresource_state(0, 0), ResourceState::COMMON);
        assert_eq!(tracker.subresource_state(1, 0), ResourceState::COPY_DEST);

        tracker.set_subresource_state(0, 0, ResourceState::COPY_DEST);
        assert_eq!(tracker.resource_state(), Some(ResourceState::COPY_DEST));
    }

    #[test]
    fn untracked_subresource_reports_unknown() {
        let mut tracker = ResourceStateTracker::new(1, 1, ResourceState::COMMON);
        tracker.set_resource_state(ResourceState::PRESENT);
        assert_eq!(tracker.subresource_state(0, 0), ResourceState::PRESENT);

        let mut split = ResourceStateTracker::new(1, 2, ResourceState::COMMON);
        split.set_subresource_state(0, 1, ResourceState::RENDER_TARGET);
        assert_eq!(split.subresource_state(5, 5), ResourceState::UNKNOWN);
    }
}
