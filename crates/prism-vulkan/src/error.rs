//! Vulkan error types.

use ash::vk;
use prism_core::RhiError;
use thiserror::Error;

/// Errors raised by the Vulkan API, the loader and the memory allocator.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found.
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// gpu-allocator failure.
    #[error("Allocation error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
}

impl From<VulkanError> for RhiError {
    fn from(error: VulkanError) -> Self {
        match error {
            VulkanError::Vulkan(vk::Result::ERROR_DEVICE_LOST) => Self::DeviceLost,
            VulkanError::Vulkan(vk::Result::TIMEOUT) => Self::Timeout(0),
            VulkanError::Vulkan(
                result @ (vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                | vk::Result::ERROR_OUT_OF_HOST_MEMORY
                | vk::Result::ERROR_OUT_OF_POOL_MEMORY
                | vk::Result::ERROR_FRAGMENTED_POOL),
            ) => Self::AllocationFailed(result.to_string()),
            VulkanError::Vulkan(vk::Result::ERROR_EXTENSION_NOT_PRESENT) => {
                Self::ExtensionNotSupported("device extension".to_string())
            }
            VulkanError::Vulkan(result) => Self::Backend(result.to_string()),
            VulkanError::Loading(error) => Self::BackendUnavailable(error.to_string()),
            VulkanError::Allocation(error) => Self::AllocationFailed(error.to_string()),
        }
    }
}

/// Result type alias for raw Vulkan calls.
pub type VkResult<T> = std::result::Result<T, VulkanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_keeps_its_meaning() {
        let error: RhiError = VulkanError::from(vk::Result::ERROR_DEVICE_LOST).into();
        assert!(matches!(error, RhiError::DeviceLost));
    }

    #[test]
    fn out_of_memory_is_an_allocation_failure() {
        let error: RhiError = VulkanError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).into();
        assert!(matches!(error, RhiError::AllocationFailed(_)));
    }

    #[test]
    fn other_results_are_backend_errors() {
        let error: RhiError = VulkanError::from(vk::Result::ERROR_INITIALIZATION_FAILED).into();
        assert!(matches!(error, RhiError::Backend(_)));
    }
}
