//! Backend-independent core of the prism render-hardware interface.
//!
//! This crate provides:
//! - The object model shared by every backend (devices, resources, views,
//!   binding sets, pipelines, command lists, fences, swapchains)
//! - Binding-model planners for root tables and descriptor sets
//! - Growable descriptor pools with RAII slot ranges
//! - Per-subresource state tracking and barrier elision
//! - Texture upload helpers, validation filtering, configuration and logging

pub mod acceleration;
pub mod binding;
pub mod command;
pub mod config;
pub mod contract;
pub mod descriptor_pool;
pub mod device;
pub mod error;
pub mod fence;
pub mod format;
pub mod interface;
pub mod layout;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod query;
pub mod resource;
pub mod retain;
pub mod state;
pub mod swapchain;
pub mod upload;
pub mod validation;
pub mod view;

pub use acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, CopyAccelerationStructureMode,
    GeometryBuffer, RaytracingAsPrebuildInfo, RaytracingGeometryDesc, RaytracingGeometryFlags,
    RaytracingGeometryInstance, RaytracingInstanceFlags, ACCELERATION_STRUCTURE_ALIGNMENT,
};
pub use binding::{
    BindKey, BindingConstants, BindingConstantsData, BindingDesc, BindingSet, BindingSetLayout,
    BindingSetLayoutDesc, ShaderStages, ShaderType, WriteBindingsDesc, BINDLESS_COUNT,
};
pub use command::{
    BufferCopyRegion, BufferToTextureCopyRegion, ClearDesc, CommandList, CommandListState,
    CommandListType, CommandQueue, IndirectCount, RenderPassBeginDesc, ScissorRect, ShadingRate,
    ShadingRateCombiner, TextureCopyRegion, TextureExtent3D, TextureOffset, Viewport,
};
pub use config::{DeviceConfig, InstanceConfig, ValidationFilterConfig};
pub use device::{Adapter, ApiType, Device, Instance};
pub use error::{Result, RhiError};
pub use fence::Fence;
pub use format::Format;
pub use interface::{cast, cast_arc, same_object, QueryInterface};
pub use memory::{align_up, Memory, MemoryBudget, MemoryRequirements, MemoryType};
pub use pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, InputLayoutDesc, Pipeline, PipelineType,
    RayTracingPipelineDesc, RayTracingShaderGroup, RayTracingShaderTable, RayTracingShaderTables,
    RenderPassDesc, ShaderBlob, ShaderBlobType,
};
pub use query::{QueryHeap, QueryHeapType};
pub use resource::{
    BindFlag, BufferDesc, Resource, ResourceBase, ResourceType, SamplerDesc, TextureDesc,
    TextureType,
};
pub use retain::RetainList;
pub use state::{ResourceBarrierDesc, ResourceState};
pub use swapchain::{NativeSurface, Swapchain, SwapchainDesc};
pub use upload::TextureUploadLayout;
pub use validation::{Severity, ValidationFilter};
pub use view::{BindlessTypedViewPool, View, ViewDesc, ViewDimension, ViewType};
