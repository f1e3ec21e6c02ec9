//! Instance and device configuration.

use serde::{Deserialize, Serialize};

/// How validation and debug-layer messages are filtered before logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationFilterConfig {
    /// Messages sharing this many leading bytes are logged once.
    pub dedup_prefix_len: usize,
    /// Messages containing any of these identifiers are dropped.
    pub muted_ids: Vec<String>,
    /// Messages logged before the filter goes quiet.
    pub max_messages: usize,
}

impl Default for ValidationFilterConfig {
    fn default() -> Self {
        Self {
            dedup_prefix_len: 128,
            muted_ids: [
                "UNASSIGNED-CoreValidation-Shader-InconsistentSpirv",
                "VUID-vkDestroyDevice-device-00378",
                "VUID-VkShaderModuleCreateInfo-pCode-04147",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_messages: 1024,
        }
    }
}

impl ValidationFilterConfig {
    #[must_use]
    pub const fn with_dedup_prefix_len(mut self, len: usize) -> Self {
        self.dedup_prefix_len = len;
        self
    }

    #[must_use]
    pub fn with_muted_id(mut self, id: impl Into<String>) -> Self {
        self.muted_ids.push(id.into());
        self
    }

    #[must_use]
    pub const fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }
}

/// Configuration for creating an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub app_name: String,
    /// Enable validation layers (default: true in debug builds).
    pub validation: bool,
    pub validation_filter: ValidationFilterConfig,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "prism".to_string(),
            validation: cfg!(debug_assertions),
            validation_filter: ValidationFilterConfig::default(),
        }
    }
}

impl InstanceConfig {
    #[must_use]
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    #[must_use]
    pub const fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    #[must_use]
    pub fn with_validation_filter(mut self, filter: ValidationFilterConfig) -> Self {
        self.validation_filter = filter;
        self
    }
}

/// Optional features requested when creating a device.
///
/// Each `enable_*` flag turns the feature on only when the adapter supports
/// it; the matching `Device::is_*_supported` predicate reports the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub enable_ray_tracing: bool,
    pub enable_mesh_shading: bool,
    pub enable_variable_rate_shading: bool,
    /// Initial slot count of each bindless descriptor pool.
    pub bindless_capacity: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enable_ray_tracing: true,
            enable_mesh_shading: true,
            enable_variable_rate_shading: true,
            bindless_capacity: 1024,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub const fn with_ray_tracing(mut self, enabled: bool) -> Self {
        self.enable_ray_tracing = enabled;
        self
    }

    #[must_use]
    pub const fn with_mesh_shading(mut self, enabled: bool) -> Self {
        self.enable_mesh_shading = enabled;
        self
    }

    #[must_use]
    pub const fn with_variable_rate_shading(mut self, enabled: bool) -> Self {
        self.enable_variable_rate_shading = enabled;
        self
    }

    #[must_use]
    pub const fn with_bindless_capacity(mut self, capacity: u32) -> Self {
        self.bindless_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = InstanceConfig::default()
            .with_app_name("triangle")
            .with_validation(true)
            .with_validation_filter(ValidationFilterConfig::default().with_max_messages(8));
        assert_eq!(config.app_name, "triangle");
        assert!(config.validation);
        assert_eq!(config.validation_filter.max_messages, 8);

        let device = DeviceConfig::default().with_ray_tracing(false).with_bindless_capacity(16);
        assert!(!device.enable_ray_tracing);
        assert!(device.enable_mesh_shading);
        assert_eq!(device.bindless_capacity, 16);
    }

    #[test]
    fn default_filter_caps_at_1024() {
        let filter = ValidationFilterConfig::default();
        assert_eq!(filter.max_messages, 1024);
        assert!(!filter.muted_ids.is_empty());
    }
}
