//! Descriptor-set binding model.
//!
//! Each register space becomes one descriptor set and each slot one binding
//! inside it. A bindless key owns its whole set, which is served by the
//! device-wide bindless pool of its descriptor kind. Constants become inline
//! uniform blocks while the device allows, and spill to a uniform buffer
//! otherwise.

use std::collections::BTreeMap;

use crate::binding::{BindKey, BindingSetLayoutDesc, ShaderStages};
use crate::layout::{fallback_bind_key, FallbackConstantsLayout};
use crate::require;
use crate::view::ViewType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    UniformBuffer,
    Sampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    StorageBuffer,
    AccelerationStructure,
    InlineUniformBlock,
}

impl DescriptorKind {
    pub fn of(view_type: ViewType) -> Self {
        match view_type {
            ViewType::ConstantBuffer => Self::UniformBuffer,
            ViewType::Sampler => Self::Sampler,
            ViewType::Texture => Self::SampledImage,
            ViewType::RWTexture => Self::StorageImage,
            ViewType::Buffer => Self::UniformTexelBuffer,
            ViewType::RWBuffer => Self::StorageTexelBuffer,
            ViewType::StructuredBuffer | ViewType::RWStructuredBuffer => Self::StorageBuffer,
            ViewType::AccelerationStructure => Self::AccelerationStructure,
            ViewType::Unknown
            | ViewType::ShadingRateSource
            | ViewType::RenderTarget
            | ViewType::DepthStencil => {
                crate::contract_violation!("{view_type:?} views cannot be bound through a descriptor set")
            }
        }
    }
}

/// Device limits the planner works within.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetLimits {
    /// Largest inline uniform block in bytes; zero disables inline blocks.
    pub max_inline_uniform_block_size: u32,
    /// Inline uniform blocks allowed per layout.
    pub max_inline_uniform_blocks: u32,
    /// Descriptor count of a bindless binding, per kind.
    pub max_bindless_descriptors: BTreeMap<DescriptorKind, u32>,
}

impl DescriptorSetLimits {
    pub fn bindless_descriptors(&self, kind: DescriptorKind) -> u32 {
        self.max_bindless_descriptors.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Descriptor count; the byte size for inline uniform blocks.
    pub count: u32,
    pub stages: ShaderStages,
    pub variable_count: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetLayout {
    pub bindings: Vec<SetBinding>,
    /// Kind of the device-wide pool serving this set, if it is bindless.
    pub bindless_kind: Option<DescriptorKind>,
}

impl SetLayout {
    /// Descriptors of each kind a pool must provide for one set.
    pub fn descriptor_counts(&self) -> BTreeMap<DescriptorKind, u32> {
        let mut counts = BTreeMap::new();
        for binding in &self.bindings {
            *counts.entry(binding.kind).or_insert(0) += binding.count;
        }
        counts
    }

    pub fn inline_uniform_block_count(&self) -> u32 {
        self.bindings
            .iter()
            .filter(|binding| binding.kind == DescriptorKind::InlineUniformBlock)
            .count() as u32
    }

    pub fn binding(&self, binding: u32) -> Option<&SetBinding> {
        self.bindings.iter().find(|candidate| candidate.binding == binding)
    }
}

/// Planned descriptor-set layouts of a binding-set layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetPlan {
    sets: Vec<SetLayout>,
    inline_uniform_blocks: BTreeMap<BindKey, u32>,
    fallback_constants: FallbackConstantsLayout,
}

impl DescriptorSetPlan {
    pub fn plan(desc: &BindingSetLayoutDesc, limits: &DescriptorSetLimits) -> Self {
        let mut sets: BTreeMap<u32, SetLayout> = BTreeMap::new();
        let mut owners = BindingOwners::default();

        for key in &desc.bind_keys {
            let kind = DescriptorKind::of(key.view_type);
            owners.claim(key);
            let set = sets.entry(key.space).or_default();
            if key.is_bindless() {
                require!(
                    set.bindings.is_empty(),
                    "bindless key {key:?} must be the only binding in space {}",
                    key.space
                );
                set.bindings.push(SetBinding {
                    binding: key.slot,
                    kind,
                    count: limits.bindless_descriptors(kind),
                    stages: ShaderStages::ALL,
                    variable_count: true,
                });
                set.bindless_kind = Some(kind);
                continue;
            }
            require!(
                set.bindless_kind.is_none(),
                "space {} is already used by a bindless binding",
                key.space
            );
            add_binding(set, key.slot, kind, key.count, key.shader_type.stages());
        }

        let mut inline_uniform_blocks = BTreeMap::new();
        let mut spilled = Vec::new();
        for constants in &desc.constants {
            let key = constants.bind_key;
            let fits = constants.size <= limits.max_inline_uniform_block_size
                && (inline_uniform_blocks.len() as u32) < limits.max_inline_uniform_blocks;
            let set = sets.entry(key.space).or_default();
            if fits {
                owners.claim(&key);
                add_binding(
                    set,
                    key.slot,
                    DescriptorKind::InlineUniformBlock,
                    constants.size,
                    key.shader_type.stages(),
                );
                inline_uniform_blocks.insert(key, constants.size);
            } else {
                let fallback = fallback_bind_key(&key);
                owners.claim(&fallback);
                add_binding(
                    set,
                    fallback.slot,
                    DescriptorKind::UniformBuffer,
                    1,
                    fallback.shader_type.stages(),
                );
                spilled.push(*constants);
            }
        }

        let set_count = sets.keys().next_back().map_or(0, |last| last + 1);
        let sets = (0..set_count)
            .map(|space| sets.remove(&space).unwrap_or_default())
            .collect();

        Self {
            sets,
            inline_uniform_blocks,
            fallback_constants: FallbackConstantsLayout::plan(&spilled),
        }
    }

    /// Set layouts indexed by space; gaps are empty layouts.
    pub fn sets(&self) -> &[SetLayout] {
        &self.sets
    }

    /// `(set, binding)` of a key.
    pub const fn location(bind_key: &BindKey) -> (u32, u32) {
        (bind_key.space, bind_key.slot)
    }

    pub fn is_inline_uniform_block(&self, bind_key: &BindKey) -> bool {
        self.inline_uniform_blocks.contains_key(bind_key)
    }

    pub fn inline_uniform_block_count(&self) -> u32 {
        self.inline_uniform_blocks.len() as u32
    }

    pub const fn fallback_constants(&self) -> &FallbackConstantsLayout {
        &self.fallback_constants
    }
}

/// Keys already placed at each `(set, binding)`. Shader types share one
/// binding per slot, so only the same key may be declared there twice.
#[derive(Default)]
struct BindingOwners(BTreeMap<(u32, u32), BindKey>);

impl BindingOwners {
    fn claim(&mut self, key: &BindKey) {
        let location = DescriptorSetPlan::location(key);
        let owner = *self.0.entry(location).or_insert(*key);
        require!(
            owner == *key,
            "{key:?} and {owner:?} both map to set {} binding {}",
            location.0,
            location.1
        );
    }
}

fn add_binding(set: &mut SetLayout, binding: u32, kind: DescriptorKind, count: u32, stages: ShaderStages) {
    if let Some(existing) = set.bindings.iter_mut().find(|existing| existing.binding == binding) {
        require!(
            existing.kind == kind && existing.count == count,
            "binding {binding} declared as both {:?} and {kind:?}",
            existing.kind
        );
        existing.stages |= stages;
        return;
    }
    set.bindings.push(SetBinding {
        binding,
        kind,
        count,
        stages,
        variable_count: false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindingConstants, ShaderType, BINDLESS_COUNT};

    fn limits() -> DescriptorSetLimits {
        DescriptorSetLimits {
            max_inline_uniform_block_size: 256,
            max_inline_uniform_blocks: 1,
            max_bindless_descriptors: [(DescriptorKind::SampledImage, 1000)].into_iter().collect(),
        }
    }

    #[test]
    fn spaces_become_sets_and_gaps_are_filled() {
        let desc = BindingSetLayoutDesc::new([
            BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 0, 0),
            BindKey::new(ShaderType::Pixel, ViewType::Texture, 1, 2),
        ]);
        let plan = DescriptorSetPlan::plan(&desc, &limits());
        assert_eq!(plan.sets().len(), 3);
        assert!(plan.sets()[1].bindings.is_empty());
        assert_eq!(plan.sets()[2].bindings[0].binding, 1);
        assert_eq!(plan.sets()[2].bindings[0].kind, DescriptorKind::SampledImage);
    }

    #[test]
    #[should_panic(expected = "both map to set 0 binding 0")]
    fn stages_cannot_share_a_binding() {
        let desc = BindingSetLayoutDesc::new([
            BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 0, 0),
            BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 0, 0),
        ]);
        DescriptorSetPlan::plan(&desc, &limits());
    }

    #[test]
    #[should_panic(expected = "both map to set 0 binding 3")]
    fn constants_cannot_land_on_a_declared_binding() {
        let desc = BindingSetLayoutDesc::new([BindKey::new(ShaderType::Pixel, ViewType::Texture, 3, 0)])
            .with_constants([BindingConstants {
                bind_key: BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 3, 0),
                size: 16,
            }]);
        DescriptorSetPlan::plan(&desc, &limits());
    }

    #[test]
    fn spilled_constants_keep_their_own_binding() {
        let key = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 2, 0);
        let desc = BindingSetLayoutDesc::default().with_constants([BindingConstants { bind_key: key, size: 512 }]);
        let plan = DescriptorSetPlan::plan(&desc, &limits());
        let binding = plan.sets()[0].binding(2).unwrap();
        assert_eq!(binding.kind, DescriptorKind::UniformBuffer);
        assert_eq!(binding.stages, ShaderStages::PIXEL);
    }

    #[test]
    fn bindless_binding_uses_variable_count() {
        let key = BindKey::new(ShaderType::Pixel, ViewType::Texture, 0, 1).with_count(BINDLESS_COUNT);
        let plan = DescriptorSetPlan::plan(&BindingSetLayoutDesc::new([key]), &limits());
        let set = &plan.sets()[1];
        assert_eq!(set.bindless_kind, Some(DescriptorKind::SampledImage));
        assert!(set.bindings[0].variable_count);
        assert_eq!(set.bindings[0].count, 1000);
        assert_eq!(set.bindings[0].stages, ShaderStages::ALL);
    }

    #[test]
    #[should_panic(expected = "only binding")]
    fn bindless_must_own_its_set() {
        let desc = BindingSetLayoutDesc::new([
            BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 0, 0),
            BindKey::new(ShaderType::Pixel, ViewType::Texture, 1, 0).with_count(BINDLESS_COUNT),
        ]);
        DescriptorSetPlan::plan(&desc, &limits());
    }

    #[test]
    fn constants_beyond_block_limit_spill() {
        let first = BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 0, 0);
        let second = BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 1, 0);
        let oversized = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 2, 0);
        let desc = BindingSetLayoutDesc::default().with_constants([
            BindingConstants { bind_key: first, size: 16 },
            BindingConstants { bind_key: second, size: 16 },
            BindingConstants { bind_key: oversized, size: 512 },
        ]);
        let plan = DescriptorSetPlan::plan(&desc, &limits());

        assert!(plan.is_inline_uniform_block(&first));
        assert!(!plan.is_inline_uniform_block(&second));
        assert!(plan.fallback_constants().contains(&second));
        assert!(plan.fallback_constants().contains(&oversized));
        let set = &plan.sets()[0];
        assert_eq!(set.binding(0).unwrap().kind, DescriptorKind::InlineUniformBlock);
        assert_eq!(set.binding(0).unwrap().count, 16);
        assert_eq!(set.binding(1).unwrap().kind, DescriptorKind::UniformBuffer);
        assert_eq!(set.inline_uniform_block_count(), 1);
    }

    #[test]
    fn no_inline_support_spills_everything() {
        let key = BindKey::new(ShaderType::Compute, ViewType::ConstantBuffer, 0, 0);
        let desc = BindingSetLayoutDesc::default().with_constants([BindingConstants { bind_key: key, size: 4 }]);
        let plan = DescriptorSetPlan::plan(&desc, &DescriptorSetLimits::default());
        assert_eq!(plan.inline_uniform_block_count(), 0);
        assert_eq!(plan.fallback_constants().buffer_size(), 256);
    }
}
