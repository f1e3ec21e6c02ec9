//! Root-table binding model.
//!
//! Descriptors live in two set-wide heaps (resources and samplers). Each
//! `(heap type, shader type)` group of fixed-size keys becomes one root
//! table over a contiguous run of its heap; each bindless key gets a
//! dedicated table over the device-wide bindless heap. Constants are
//! embedded directly in the root while the total root cost stays within
//! the limit and spill to a constant buffer otherwise.

use std::collections::{BTreeMap, BTreeSet};

use crate::binding::{BindKey, BindingConstants, BindingSetLayoutDesc, ShaderType};
use crate::error::{Result, RhiError};
use crate::layout::{fallback_bind_key, FallbackConstantsLayout};
use crate::view::ViewType;

/// Root cost budget in 32-bit values.
pub const DEFAULT_ROOT_COST_LIMIT: u32 = 64;

/// Root cost of one descriptor table.
const TABLE_COST: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorHeapType {
    CbvSrvUav,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorRangeType {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

impl DescriptorRangeType {
    pub fn of(view_type: ViewType) -> Self {
        match view_type {
            ViewType::Texture
            | ViewType::Buffer
            | ViewType::StructuredBuffer
            | ViewType::AccelerationStructure => Self::Srv,
            ViewType::RWTexture | ViewType::RWBuffer | ViewType::RWStructuredBuffer => Self::Uav,
            ViewType::ConstantBuffer => Self::Cbv,
            ViewType::Sampler => Self::Sampler,
            ViewType::Unknown
            | ViewType::ShadingRateSource
            | ViewType::RenderTarget
            | ViewType::DepthStencil => {
                crate::contract_violation!("{view_type:?} views cannot be bound through a root table")
            }
        }
    }

    pub const fn heap_type(self) -> DescriptorHeapType {
        match self {
            Self::Sampler => DescriptorHeapType::Sampler,
            Self::Srv | Self::Uav | Self::Cbv => DescriptorHeapType::CbvSrvUav,
        }
    }
}

/// One register range inside a root table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    pub range_type: DescriptorRangeType,
    /// `u32::MAX` for an unbounded range.
    pub num_descriptors: u32,
    pub base_register: u32,
    pub space: u32,
    pub offset_in_table: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootTable {
    pub heap_type: DescriptorHeapType,
    /// Start of the table inside the set's heap range; zero for bindless
    /// tables, which cover the whole device-wide heap.
    pub heap_offset: u32,
    pub bindless: bool,
    pub is_compute: bool,
    pub visibility: ShaderType,
    pub ranges: Vec<DescriptorRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootConstants {
    pub bind_key: BindKey,
    pub num_values: u32,
    pub is_compute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootParameter {
    Table(RootTable),
    Constants(RootConstants),
}

impl RootParameter {
    pub const fn cost(&self) -> u32 {
        match self {
            Self::Table(_) => TABLE_COST,
            Self::Constants(constants) => constants.num_values,
        }
    }
}

/// Where one fixed-size key lives inside the set's heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingLocation {
    pub heap_type: DescriptorHeapType,
    pub heap_offset: u32,
}

/// Planned root signature of a binding-set layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootTableLayout {
    parameters: Vec<RootParameter>,
    layout: BTreeMap<BindKey, BindingLocation>,
    heap_descs: BTreeMap<DescriptorHeapType, u32>,
    root_constants: BTreeMap<BindKey, u32>,
    fallback_constants: FallbackConstantsLayout,
    root_cost: u32,
}

impl RootTableLayout {
    /// Plan the root signature for `desc` within `root_cost_limit`.
    ///
    /// Fails when the descriptor tables alone exceed the limit.
    pub fn plan(desc: &BindingSetLayoutDesc, root_cost_limit: u32) -> Result<Self> {
        let table_count = |spilled: &[BindingConstants]| {
            let mut groups = BTreeSet::new();
            let mut bindless = 0;
            for key in &desc.bind_keys {
                if key.is_bindless() {
                    bindless += 1;
                } else {
                    groups.insert(group_of(key));
                }
            }
            for constants in spilled {
                groups.insert(group_of(&fallback_bind_key(&constants.bind_key)));
            }
            (bindless + groups.len()) as u32 * TABLE_COST
        };

        let mut inline: Vec<BindingConstants> = Vec::new();
        let mut spilled: Vec<BindingConstants> = Vec::new();
        let mut inline_cost = 0;
        for constants in &desc.constants {
            let tables = table_count(&spilled);
            if tables + inline_cost + constants.dword_count() <= root_cost_limit {
                inline_cost += constants.dword_count();
                inline.push(*constants);
            } else {
                spilled.push(*constants);
            }
        }
        // A spill may have opened a new table group after earlier constants
        // were placed inline.
        while table_count(&spilled) + inline_cost > root_cost_limit {
            let Some(constants) = inline.pop() else {
                break;
            };
            inline_cost -= constants.dword_count();
            spilled.insert(0, constants);
        }

        let tables = table_count(&spilled);
        if tables + inline_cost > root_cost_limit {
            return Err(RhiError::InvalidState(format!(
                "root signature needs {tables} tables, exceeding the root cost limit of {root_cost_limit}"
            )));
        }
        spilled.sort_by_key(|constants| {
            desc.constants
                .iter()
                .position(|declared| declared.bind_key == constants.bind_key)
        });

        let mut plan = Self {
            parameters: Vec::new(),
            layout: BTreeMap::new(),
            heap_descs: BTreeMap::new(),
            root_constants: BTreeMap::new(),
            fallback_constants: FallbackConstantsLayout::plan(&spilled),
            root_cost: 0,
        };

        let spilled_keys = spilled.iter().map(|constants| fallback_bind_key(&constants.bind_key));
        let mut groups: BTreeMap<(DescriptorHeapType, ShaderType), (u32, Vec<DescriptorRange>)> =
            BTreeMap::new();
        for key in desc.bind_keys.iter().copied().chain(spilled_keys) {
            let range_type = DescriptorRangeType::of(key.view_type);
            let heap_type = range_type.heap_type();
            if key.is_bindless() {
                plan.push(RootParameter::Table(RootTable {
                    heap_type,
                    heap_offset: 0,
                    bindless: true,
                    is_compute: key.shader_type.is_compute(),
                    visibility: key.shader_type,
                    ranges: vec![DescriptorRange {
                        range_type,
                        num_descriptors: u32::MAX,
                        base_register: key.slot,
                        space: key.space,
                        offset_in_table: 0,
                    }],
                }));
                continue;
            }

            let heap_size = plan.heap_descs.entry(heap_type).or_insert(0);
            let heap_offset = *heap_size;
            *heap_size += key.count;
            plan.layout.insert(
                key,
                BindingLocation {
                    heap_type,
                    heap_offset,
                },
            );

            let (table_offset, ranges) = groups
                .entry((heap_type, key.shader_type))
                .or_insert_with(|| (heap_offset, Vec::new()));
            ranges.push(DescriptorRange {
                range_type,
                num_descriptors: key.count,
                base_register: key.slot,
                space: key.space,
                offset_in_table: heap_offset - *table_offset,
            });
        }

        for ((heap_type, shader_type), (heap_offset, ranges)) in groups {
            plan.push(RootParameter::Table(RootTable {
                heap_type,
                heap_offset,
                bindless: false,
                is_compute: shader_type.is_compute(),
                visibility: shader_type,
                ranges,
            }));
        }

        for constants in inline {
            let index = plan.parameters.len() as u32;
            plan.push(RootParameter::Constants(RootConstants {
                bind_key: constants.bind_key,
                num_values: constants.dword_count(),
                is_compute: constants.bind_key.shader_type.is_compute(),
            }));
            plan.root_constants.insert(constants.bind_key, index);
        }

        Ok(plan)
    }

    fn push(&mut self, parameter: RootParameter) {
        self.root_cost += parameter.cost();
        self.parameters.push(parameter);
    }

    pub fn parameters(&self) -> &[RootParameter] {
        &self.parameters
    }

    /// Heap location of a fixed-size key, including synthesized
    /// constant-buffer keys of spilled constants.
    pub fn location(&self, bind_key: &BindKey) -> Option<BindingLocation> {
        self.layout.get(bind_key).copied()
    }

    /// Descriptors each set-wide heap needs.
    pub const fn heap_descs(&self) -> &BTreeMap<DescriptorHeapType, u32> {
        &self.heap_descs
    }

    /// Root parameter index of constants embedded in the root.
    pub fn root_constants_index(&self, bind_key: &BindKey) -> Option<u32> {
        self.root_constants.get(bind_key).copied()
    }

    pub const fn fallback_constants(&self) -> &FallbackConstantsLayout {
        &self.fallback_constants
    }

    pub const fn root_cost(&self) -> u32 {
        self.root_cost
    }
}

fn group_of(key: &BindKey) -> (DescriptorHeapType, ShaderType) {
    (DescriptorRangeType::of(key.view_type).heap_type(), key.shader_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BINDLESS_COUNT;

    fn key(shader_type: ShaderType, view_type: ViewType, slot: u32) -> BindKey {
        BindKey::new(shader_type, view_type, slot, 0)
    }

    #[test]
    fn groups_share_one_table_per_heap_and_stage() {
        let cbv = key(ShaderType::Pixel, ViewType::ConstantBuffer, 0);
        let srv = key(ShaderType::Pixel, ViewType::Texture, 0).with_count(2);
        let sampler = key(ShaderType::Pixel, ViewType::Sampler, 0);
        let vertex_cbv = key(ShaderType::Vertex, ViewType::ConstantBuffer, 0);
        let desc = BindingSetLayoutDesc::new([cbv, srv, sampler, vertex_cbv]);
        let plan = RootTableLayout::plan(&desc, DEFAULT_ROOT_COST_LIMIT).unwrap();

        assert_eq!(plan.parameters().len(), 3);
        assert_eq!(plan.heap_descs()[&DescriptorHeapType::CbvSrvUav], 4);
        assert_eq!(plan.heap_descs()[&DescriptorHeapType::Sampler], 1);
        assert_eq!(plan.location(&cbv).unwrap().heap_offset, 0);
        assert_eq!(plan.location(&srv).unwrap().heap_offset, 1);
        assert_eq!(plan.location(&vertex_cbv).unwrap().heap_offset, 3);
        assert_eq!(plan.location(&sampler).unwrap().heap_type, DescriptorHeapType::Sampler);

        let pixel_table = plan
            .parameters()
            .iter()
            .find_map(|parameter| match parameter {
                RootParameter::Table(table)
                    if table.visibility == ShaderType::Pixel
                        && table.heap_type == DescriptorHeapType::CbvSrvUav =>
                {
                    Some(table)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(pixel_table.ranges.len(), 2);
        assert_eq!(pixel_table.ranges[1].offset_in_table, 1);
    }

    #[test]
    fn locations_never_overlap() {
        let keys: Vec<BindKey> = (0..6)
            .map(|slot| key(ShaderType::Compute, ViewType::RWBuffer, slot).with_count(slot + 1))
            .collect();
        let plan = RootTableLayout::plan(&BindingSetLayoutDesc::new(keys.clone()), 64).unwrap();
        let mut spans: Vec<(u32, u32)> = keys
            .iter()
            .map(|key| {
                let location = plan.location(key).unwrap();
                (location.heap_offset, location.heap_offset + key.count)
            })
            .collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn bindless_keys_get_dedicated_tables() {
        let textures = key(ShaderType::Pixel, ViewType::Texture, 0).with_count(BINDLESS_COUNT);
        let buffers = key(ShaderType::Pixel, ViewType::StructuredBuffer, 1).with_count(BINDLESS_COUNT);
        let cbv = key(ShaderType::Pixel, ViewType::ConstantBuffer, 0);
        let plan = RootTableLayout::plan(&BindingSetLayoutDesc::new([textures, buffers, cbv]), 64).unwrap();

        let bindless: Vec<&RootTable> = plan
            .parameters()
            .iter()
            .filter_map(|parameter| match parameter {
                RootParameter::Table(table) if table.bindless => Some(table),
                _ => None,
            })
            .collect();
        assert_eq!(bindless.len(), 2);
        assert!(bindless.iter().all(|table| table.heap_offset == 0));
        assert!(plan.location(&textures).is_none());
        assert_eq!(plan.heap_descs()[&DescriptorHeapType::CbvSrvUav], 1);
    }

    #[test]
    fn constants_fit_in_root() {
        let constants_key = key(ShaderType::Vertex, ViewType::ConstantBuffer, 0);
        let desc = BindingSetLayoutDesc::new([key(ShaderType::Pixel, ViewType::Texture, 0)])
            .with_constants([BindingConstants {
                bind_key: constants_key,
                size: 16,
            }]);
        let plan = RootTableLayout::plan(&desc, 64).unwrap();
        assert_eq!(plan.root_constants_index(&constants_key), Some(1));
        assert!(plan.fallback_constants().is_empty());
        assert_eq!(plan.root_cost(), 5);
    }

    #[test]
    fn constants_over_limit_spill_to_buffer() {
        let small = key(ShaderType::Vertex, ViewType::ConstantBuffer, 0);
        let large = key(ShaderType::Vertex, ViewType::ConstantBuffer, 1);
        let desc = BindingSetLayoutDesc::new([key(ShaderType::Pixel, ViewType::Texture, 0)]).with_constants([
            BindingConstants {
                bind_key: small,
                size: 16,
            },
            BindingConstants {
                bind_key: large,
                size: 256,
            },
        ]);
        let plan = RootTableLayout::plan(&desc, 64).unwrap();

        assert_eq!(plan.root_constants_index(&small), Some(2));
        assert_eq!(plan.root_constants_index(&large), None);
        assert!(plan.fallback_constants().contains(&large));
        assert!(plan.location(&fallback_bind_key(&large)).is_some());
        assert!(plan.root_cost() <= 64);
    }

    #[test]
    fn spill_table_cost_demotes_inline_constants() {
        // Three tables leave one value of headroom; the 1-value constant
        // fits alone but the spilled 2-value constant needs a new table.
        let tables = [
            key(ShaderType::Pixel, ViewType::Texture, 0),
            key(ShaderType::Pixel, ViewType::Sampler, 0),
            key(ShaderType::Compute, ViewType::RWTexture, 0),
        ];
        let one = key(ShaderType::Vertex, ViewType::ConstantBuffer, 0);
        let two = key(ShaderType::Vertex, ViewType::ConstantBuffer, 1);
        let desc = BindingSetLayoutDesc::new(tables).with_constants([
            BindingConstants { bind_key: one, size: 4 },
            BindingConstants { bind_key: two, size: 8 },
        ]);
        let plan = RootTableLayout::plan(&desc, 4).unwrap();
        assert_eq!(plan.root_constants_index(&one), None);
        assert!(plan.fallback_constants().contains(&one));
        assert!(plan.fallback_constants().contains(&two));
        assert_eq!(plan.root_cost(), 4);
    }

    #[test]
    fn too_many_tables_is_an_error() {
        let keys: Vec<BindKey> = [ShaderType::Vertex, ShaderType::Pixel, ShaderType::Compute]
            .into_iter()
            .map(|shader_type| key(shader_type, ViewType::Texture, 0))
            .collect();
        assert!(RootTableLayout::plan(&BindingSetLayoutDesc::new(keys), 2).is_err());
    }
}
