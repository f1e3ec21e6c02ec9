//! Prism render hardware interface.
//!
//! One object model (devices, resources, views, binding sets, pipelines,
//! command lists, fences, swapchains) driven through interchangeable
//! backends. Pick one at runtime with [`create_instance`].
//!
//! # Example
//!
//! ```no_run
//! use prism::{create_instance, ApiType, DeviceConfig, InstanceConfig};
//!
//! fn main() -> prism::Result<()> {
//!     let instance = create_instance(ApiType::Software, &InstanceConfig::default())?;
//!     let device = prism::create_device(&instance, &DeviceConfig::default())?;
//!     let fence = device.create_fence(0)?;
//!     fence.signal(1)?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub use prism_core::*;

/// The headless software backend.
pub use prism_software as software;

/// The Vulkan backend.
#[cfg(feature = "vulkan")]
pub use prism_vulkan as vulkan;

/// Create an instance of the backend behind `api_type`.
pub fn create_instance(api_type: ApiType, config: &InstanceConfig) -> Result<Arc<dyn Instance>> {
    tracing::debug!(%api_type, app = %config.app_name, "Creating instance");
    match api_type {
        ApiType::Software => Ok(Arc::new(software::SoftwareInstance::new(config))),
        #[cfg(feature = "vulkan")]
        ApiType::Vulkan => Ok(Arc::new(vulkan::VulkanInstance::new(config)?)),
        #[cfg(not(feature = "vulkan"))]
        ApiType::Vulkan => Err(RhiError::BackendUnavailable(
            "prism was built without the `vulkan` feature".to_string(),
        )),
    }
}

/// Create a device on the preferred adapter of `instance`.
pub fn create_device(instance: &Arc<dyn Instance>, config: &DeviceConfig) -> Result<Arc<dyn Device>> {
    let adapters = instance.enumerate_adapters()?;
    let adapter = adapters.first().ok_or(RhiError::NoSuitableAdapter)?;
    tracing::info!(adapter = %adapter.name(), api = %instance.api_type(), "Using adapter");
    adapter.create_device(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_instance_has_one_adapter() {
        let instance = create_instance(ApiType::Software, &InstanceConfig::default()).unwrap();
        assert_eq!(instance.api_type(), ApiType::Software);
        let adapters = instance.enumerate_adapters().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].name(), software::instance::ADAPTER_NAME);
    }

    #[test]
    fn devices_report_spirv_blobs() {
        let instance = create_instance(ApiType::Software, &InstanceConfig::default()).unwrap();
        let device = create_device(&instance, &DeviceConfig::default()).unwrap();
        assert_eq!(device.supported_shader_blob_type(), ShaderBlobType::Spirv);
        device.wait_idle().unwrap();
    }

    #[cfg(not(feature = "vulkan"))]
    #[test]
    fn vulkan_needs_the_feature() {
        let result = create_instance(ApiType::Vulkan, &InstanceConfig::default());
        assert!(matches!(result, Err(RhiError::BackendUnavailable(_))));
    }
}
