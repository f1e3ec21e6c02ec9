//! Software device configuration.

use prism_core::layout::descriptor_set::{DescriptorKind, DescriptorSetLimits};
use prism_core::layout::root_table::DEFAULT_ROOT_COST_LIMIT;
use serde::{Deserialize, Serialize};

/// Binding model the software device emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingModel {
    /// Flat descriptor heaps addressed through root tables.
    RootTables { root_cost_limit: u32 },
    /// Numbered descriptor sets with inline uniform blocks.
    DescriptorSets {
        max_inline_uniform_block_size: u32,
        max_inline_uniform_blocks: u32,
    },
}

impl Default for BindingModel {
    fn default() -> Self {
        Self::RootTables {
            root_cost_limit: DEFAULT_ROOT_COST_LIMIT,
        }
    }
}

impl BindingModel {
    pub const fn descriptor_sets() -> Self {
        Self::DescriptorSets {
            max_inline_uniform_block_size: 256,
            max_inline_uniform_blocks: 4,
        }
    }

    pub(crate) fn descriptor_set_limits(max_inline_uniform_block_size: u32, max_inline_uniform_blocks: u32) -> DescriptorSetLimits {
        let kinds = [
            DescriptorKind::UniformBuffer,
            DescriptorKind::Sampler,
            DescriptorKind::SampledImage,
            DescriptorKind::StorageImage,
            DescriptorKind::UniformTexelBuffer,
            DescriptorKind::StorageTexelBuffer,
            DescriptorKind::StorageBuffer,
            DescriptorKind::AccelerationStructure,
        ];
        DescriptorSetLimits {
            max_inline_uniform_block_size,
            max_inline_uniform_blocks,
            max_bindless_descriptors: kinds.into_iter().map(|kind| (kind, MAX_BINDLESS_DESCRIPTORS)).collect(),
        }
    }
}

/// Upper bound of every bindless pool.
pub const MAX_BINDLESS_DESCRIPTORS: u32 = 1 << 20;

/// Optional features the software device advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareFeatures {
    pub ray_tracing: bool,
    pub ray_query: bool,
    pub variable_rate_shading: bool,
    pub mesh_shading: bool,
    pub draw_indirect_count: bool,
    pub geometry_shader: bool,
    pub bindless: bool,
}

impl Default for SoftwareFeatures {
    fn default() -> Self {
        Self {
            ray_tracing: true,
            ray_query: true,
            variable_rate_shading: true,
            mesh_shading: true,
            draw_indirect_count: true,
            geometry_shader: true,
            bindless: true,
        }
    }
}

/// Configuration of a software device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareDeviceConfig {
    pub binding_model: BindingModel,
    pub features: SoftwareFeatures,
    /// Bytes of memory the device reports and enforces as its budget.
    pub memory_budget: u64,
    /// How long a CPU fence wait may block before reporting a timeout.
    pub fence_timeout_ms: u64,
}

impl Default for SoftwareDeviceConfig {
    fn default() -> Self {
        Self {
            binding_model: BindingModel::default(),
            features: SoftwareFeatures::default(),
            memory_budget: 1 << 30,
            fence_timeout_ms: 5_000,
        }
    }
}

impl SoftwareDeviceConfig {
    #[must_use]
    pub const fn with_binding_model(mut self, binding_model: BindingModel) -> Self {
        self.binding_model = binding_model;
        self
    }

    #[must_use]
    pub const fn with_features(mut self, features: SoftwareFeatures) -> Self {
        self.features = features;
        self
    }

    #[must_use]
    pub const fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    #[must_use]
    pub const fn with_fence_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.fence_timeout_ms = timeout_ms;
        self
    }
}
