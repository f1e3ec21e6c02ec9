//! Backend-independent binding-model planners.
//!
//! A planner turns a [`BindingSetLayoutDesc`](crate::binding::BindingSetLayoutDesc)
//! into the locations a backend binds descriptors and constants at. Both
//! planners spill constants they cannot place natively into a per-set
//! upload buffer laid out by [`FallbackConstantsLayout`].

pub mod descriptor_set;
pub mod root_table;

use std::collections::BTreeMap;

use crate::binding::{BindKey, BindingConstants};
use crate::memory::align_up;
use crate::view::ViewType;

/// Placement alignment of constant-buffer views.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Region of the fallback constants buffer backing one constants key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackRegion {
    pub offset: u64,
    pub size: u32,
}

/// Layout of the upload buffer that holds constants spilled out of the
/// native fast path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackConstantsLayout {
    regions: BTreeMap<BindKey, FallbackRegion>,
    buffer_size: u64,
}

impl FallbackConstantsLayout {
    /// Give each constants range its own 256-byte aligned region.
    pub fn plan(constants: &[BindingConstants]) -> Self {
        let mut regions = BTreeMap::new();
        let mut buffer_size = 0;
        for constants in constants {
            regions.insert(
                constants.bind_key,
                FallbackRegion {
                    offset: buffer_size,
                    size: constants.size,
                },
            );
            buffer_size += align_up(u64::from(constants.size), CONSTANT_BUFFER_ALIGNMENT);
        }
        Self {
            regions,
            buffer_size,
        }
    }

    pub fn region(&self, bind_key: &BindKey) -> Option<FallbackRegion> {
        self.regions.get(bind_key).copied()
    }

    pub fn regions(&self) -> impl Iterator<Item = (&BindKey, &FallbackRegion)> {
        self.regions.iter()
    }

    pub const fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn contains(&self, bind_key: &BindKey) -> bool {
        self.regions.contains_key(bind_key)
    }
}

/// Constant-buffer key that serves spilled constants at the same register.
pub const fn fallback_bind_key(bind_key: &BindKey) -> BindKey {
    BindKey {
        shader_type: bind_key.shader_type,
        view_type: ViewType::ConstantBuffer,
        slot: bind_key.slot,
        space: bind_key.space,
        count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ShaderType;

    #[test]
    fn fallback_regions_are_aligned() {
        let a = BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 0, 0);
        let b = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 1, 0);
        let layout = FallbackConstantsLayout::plan(&[
            BindingConstants { bind_key: a, size: 4 },
            BindingConstants { bind_key: b, size: 300 },
        ]);
        assert_eq!(layout.region(&a), Some(FallbackRegion { offset: 0, size: 4 }));
        assert_eq!(layout.region(&b), Some(FallbackRegion { offset: 256, size: 300 }));
        assert_eq!(layout.buffer_size(), 768);
    }

    #[test]
    fn fallback_key_keeps_register() {
        let key = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 3, 2).with_count(4);
        let fallback = fallback_bind_key(&key);
        assert_eq!(fallback.slot, 3);
        assert_eq!(fallback.space, 2);
        assert_eq!(fallback.count, 1);
    }
}
