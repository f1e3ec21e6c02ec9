//! Instance and adapter of the software backend.

use std::sync::Arc;

use prism_core::config::{DeviceConfig, InstanceConfig};
use prism_core::device::{Adapter, ApiType, Device, Instance};
use prism_core::validation::ValidationFilter;
use prism_core::{impl_query_interface, Result};

use crate::config::{SoftwareDeviceConfig, SoftwareFeatures};
use crate::device::SoftwareDevice;

/// Name the single software adapter reports.
pub const ADAPTER_NAME: &str = "Prism Software Adapter";

pub struct SoftwareInstance {
    validation: Arc<ValidationFilter>,
    device_config: SoftwareDeviceConfig,
}

impl_query_interface!(SoftwareInstance);

impl SoftwareInstance {
    pub fn new(config: &InstanceConfig) -> Self {
        Self::with_device_config(config, SoftwareDeviceConfig::default())
    }

    /// Instance whose devices start from `device_config` before the
    /// per-device feature requests are applied.
    pub fn with_device_config(config: &InstanceConfig, device_config: SoftwareDeviceConfig) -> Self {
        tracing::info!(app = %config.app_name, "Software instance created");
        Self {
            validation: Arc::new(ValidationFilter::new(config.validation_filter.clone())),
            device_config,
        }
    }
}

impl Instance for SoftwareInstance {
    fn api_type(&self) -> ApiType {
        ApiType::Software
    }

    fn enumerate_adapters(&self) -> Result<Vec<Arc<dyn Adapter>>> {
        Ok(vec![Arc::new(SoftwareAdapter {
            validation: Arc::clone(&self.validation),
            device_config: self.device_config.clone(),
        })])
    }

    fn validation(&self) -> Arc<ValidationFilter> {
        Arc::clone(&self.validation)
    }
}

pub struct SoftwareAdapter {
    validation: Arc<ValidationFilter>,
    device_config: SoftwareDeviceConfig,
}

impl_query_interface!(SoftwareAdapter);

/// Apply the optional-feature requests of `config` to what the adapter offers.
fn requested_features(offered: SoftwareFeatures, config: &DeviceConfig) -> SoftwareFeatures {
    SoftwareFeatures {
        ray_tracing: offered.ray_tracing && config.enable_ray_tracing,
        ray_query: offered.ray_query && config.enable_ray_tracing,
        mesh_shading: offered.mesh_shading && config.enable_mesh_shading,
        variable_rate_shading: offered.variable_rate_shading && config.enable_variable_rate_shading,
        ..offered
    }
}

impl Adapter for SoftwareAdapter {
    fn name(&self) -> String {
        ADAPTER_NAME.to_string()
    }

    fn create_device(&self, config: &DeviceConfig) -> Result<Arc<dyn Device>> {
        let features = requested_features(self.device_config.features, config);
        tracing::debug!(
            ?features,
            bindless_capacity = config.bindless_capacity,
            "Software device features resolved"
        );
        let device_config = self.device_config.clone().with_features(features);
        Ok(Arc::new(SoftwareDevice::new(
            device_config,
            Arc::clone(&self.validation),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_adapter_named_after_backend() {
        let instance = SoftwareInstance::new(&InstanceConfig::default());
        assert_eq!(instance.api_type(), ApiType::Software);
        let adapters = instance.enumerate_adapters().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].name(), ADAPTER_NAME);
    }

    #[test]
    fn disabled_requests_turn_features_off() {
        let instance = SoftwareInstance::new(&InstanceConfig::default());
        let adapter = &instance.enumerate_adapters().unwrap()[0];
        let config = DeviceConfig::default().with_ray_tracing(false).with_mesh_shading(false);
        let device = adapter.create_device(&config).unwrap();
        assert!(!device.is_dxr_supported());
        assert!(!device.is_ray_query_supported());
        assert!(!device.is_mesh_shading_supported());
        assert!(device.is_variable_rate_shading_supported());
        assert!(device.is_bindless_supported());
    }

    #[test]
    fn requests_cannot_enable_what_is_not_offered() {
        let offered = SoftwareFeatures {
            mesh_shading: false,
            ..SoftwareFeatures::default()
        };
        let features = requested_features(offered, &DeviceConfig::default());
        assert!(!features.mesh_shading);
        assert!(features.ray_tracing);
    }
}
