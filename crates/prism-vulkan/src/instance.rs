//! Vulkan instance, debug messenger and adapters.

use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use ash::vk;
use prism_core::config::{DeviceConfig, InstanceConfig};
use prism_core::device::{Adapter, ApiType, Device, Instance};
use prism_core::validation::{Severity, ValidationFilter};
use prism_core::{impl_query_interface, Result, RhiError};

use crate::capabilities::AdapterCapabilities;
use crate::device::VulkanDevice;
use crate::error::VulkanError;

/// Instance extensions needed to present to any supported window system.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xcb_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Loader, instance and messenger shared by adapters and devices.
pub struct InstanceShared {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) surface_loader: ash::khr::surface::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub(crate) validation: Arc<ValidationFilter>,
    pub(crate) debug_utils_enabled: bool,
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        // The messenger callback borrowed one strong count of the filter.
        unsafe { Arc::decrement_strong_count(Arc::as_ptr(&self.validation)) };
    }
}

fn severity_of(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Severity {
    if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Severity::Error
    } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Severity::Warning
    } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        Severity::Info
    } else {
        Severity::Verbose
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || user_data.is_null() {
        return vk::FALSE;
    }
    let data = unsafe { &*callback_data };
    let filter = unsafe { &*user_data.cast::<ValidationFilter>() };
    let text = |ptr: *const std::ffi::c_char| {
        if ptr.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
        }
    };
    let id = text(data.p_message_id_name);
    let message = text(data.p_message);
    filter.report(severity_of(severity), &format!("[{id}] {message}"));
    vk::FALSE
}

pub struct VulkanInstance {
    shared: Arc<InstanceShared>,
}

impl_query_interface!(VulkanInstance);

impl VulkanInstance {
    pub fn new(config: &InstanceConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(VulkanError::from)?;
        let validation = Arc::new(ValidationFilter::new(config.validation_filter.clone()));

        let app_name = CString::new(config.app_name.as_str())
            .map_err(|e| RhiError::Other(format!("Invalid application name: {e}")))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Prism")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
            .map_err(VulkanError::from)?;
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(VulkanError::from)?;
        let layer_available = available_layers
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        let debug_utils_available = available_extensions
            .iter()
            .any(|props| props.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME));

        let mut layer_names = Vec::new();
        if config.validation {
            if layer_available {
                layer_names.push(VALIDATION_LAYER.as_ptr());
            } else {
                tracing::warn!("Validation layer {VALIDATION_LAYER:?} not available");
            }
        }
        let mut extension_names: Vec<*const std::ffi::c_char> = required_instance_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();
        if debug_utils_available {
            extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);
        let instance =
            unsafe { entry.create_instance(&create_info, None) }.map_err(VulkanError::from)?;

        // The callback reads the filter through a raw pointer; one strong
        // count is held for it and released when the instance is dropped.
        let user_data = Arc::into_raw(Arc::clone(&validation)).cast_mut().cast::<c_void>();
        let debug_utils = if debug_utils_available && config.validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback))
                .user_data(user_data);
            match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    tracing::warn!("Debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        tracing::info!(
            app = %config.app_name,
            validation = config.validation && layer_available,
            "Vulkan instance created"
        );
        Ok(Self {
            shared: Arc::new(InstanceShared {
                entry,
                instance,
                surface_loader,
                debug_utils,
                validation,
                debug_utils_enabled: debug_utils_available,
            }),
        })
    }

    pub const fn shared(&self) -> &Arc<InstanceShared> {
        &self.shared
    }
}

impl Instance for VulkanInstance {
    fn api_type(&self) -> ApiType {
        ApiType::Vulkan
    }

    fn enumerate_adapters(&self) -> Result<Vec<Arc<dyn Adapter>>> {
        let physical_devices = unsafe { self.shared.instance.enumerate_physical_devices() }
            .map_err(VulkanError::from)?;
        let mut adapters: Vec<VulkanAdapter> = physical_devices
            .into_iter()
            .filter_map(|physical_device| {
                let capabilities =
                    unsafe { AdapterCapabilities::query(&self.shared.instance, physical_device) };
                if capabilities.meets_requirements() {
                    Some(VulkanAdapter {
                        shared: Arc::clone(&self.shared),
                        physical_device,
                        capabilities,
                    })
                } else {
                    tracing::warn!("Skipping adapter: {}", capabilities.summary());
                    None
                }
            })
            .collect();
        if adapters.is_empty() {
            return Err(RhiError::NoSuitableAdapter);
        }
        adapters.sort_by_key(|adapter| std::cmp::Reverse(adapter.capabilities.score()));
        Ok(adapters
            .into_iter()
            .map(|adapter| Arc::new(adapter) as Arc<dyn Adapter>)
            .collect())
    }

    fn validation(&self) -> Arc<ValidationFilter> {
        Arc::clone(&self.shared.validation)
    }
}

pub struct VulkanAdapter {
    shared: Arc<InstanceShared>,
    physical_device: vk::PhysicalDevice,
    capabilities: AdapterCapabilities,
}

impl_query_interface!(VulkanAdapter);

impl VulkanAdapter {
    pub const fn capabilities(&self) -> &AdapterCapabilities {
        &self.capabilities
    }
}

impl Adapter for VulkanAdapter {
    fn name(&self) -> String {
        self.capabilities.device_name.clone()
    }

    fn create_device(&self, config: &DeviceConfig) -> Result<Arc<dyn Device>> {
        tracing::info!("Selected GPU: {}", self.capabilities.summary());
        let device = VulkanDevice::new(
            Arc::clone(&self.shared),
            self.physical_device,
            self.capabilities.clone(),
            config,
        )?;
        Ok(Arc::new(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_map_to_the_strongest_bit() {
        assert_eq!(
            severity_of(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            ),
            Severity::Error
        );
        assert_eq!(
            severity_of(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING),
            Severity::Warning
        );
        assert_eq!(
            severity_of(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE),
            Severity::Verbose
        );
    }

    #[test]
    fn surface_extension_is_always_required() {
        assert!(required_instance_extensions().contains(&ash::khr::surface::NAME));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn enumerates_at_least_one_adapter() {
        let instance = VulkanInstance::new(&InstanceConfig::default()).unwrap();
        let adapters = instance.enumerate_adapters().unwrap();
        assert!(!adapters.is_empty());
    }
}
