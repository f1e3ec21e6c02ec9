//! Vulkan backend for the Prism render hardware interface.
//!
//! This crate provides:
//! - Instance creation with validation layers routed into the validation filter
//! - GPU capability detection and adapter ranking
//! - Memory allocation via gpu-allocator, including placed resources
//! - Dynamic rendering, synchronization2 barriers and timeline fences
//! - Descriptor-set binding with device-wide bindless pools
//! - Ray tracing, mesh shading and variable rate shading when the adapter has them

pub mod acceleration;
pub mod barrier;
pub mod binding;
pub mod capabilities;
pub mod command_list;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod fence;
pub mod format;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod resource;
pub mod swapchain;
pub mod view;

pub use capabilities::{AdapterCapabilities, GpuVendor};
pub use device::VulkanDevice;
pub use error::VulkanError;
pub use instance::{VulkanAdapter, VulkanInstance};
