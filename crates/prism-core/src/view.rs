//! Views over resources and bindless view pools.

use std::sync::Arc;

use crate::format::Format;
use crate::interface::QueryInterface;
use crate::resource::Resource;

/// What a view exposes its resource as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ViewType {
    #[default]
    Unknown,
    ConstantBuffer,
    Sampler,
    Texture,
    RWTexture,
    Buffer,
    RWBuffer,
    StructuredBuffer,
    RWStructuredBuffer,
    AccelerationStructure,
    ShadingRateSource,
    RenderTarget,
    DepthStencil,
}

impl ViewType {
    /// Views that shaders read or write through descriptors.
    pub const fn is_shader_visible(self) -> bool {
        !matches!(
            self,
            Self::Unknown | Self::RenderTarget | Self::DepthStencil | Self::ShadingRateSource
        )
    }

    pub const fn is_buffer(self) -> bool {
        matches!(
            self,
            Self::ConstantBuffer
                | Self::Buffer
                | Self::RWBuffer
                | Self::StructuredBuffer
                | Self::RWStructuredBuffer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ViewDimension {
    #[default]
    Unknown,
    Buffer,
    Texture1D,
    Texture1DArray,
    Texture2D,
    Texture2DArray,
    Texture2DMS,
    Texture2DMSArray,
    Texture3D,
    TextureCube,
    TextureCubeArray,
}

/// View creation parameters.
///
/// `level_count`, `layer_count` and `buffer_size` default to "everything
/// remaining" and are clamped against the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewDesc {
    pub view_type: ViewType,
    pub dimension: ViewDimension,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub plane_slice: u32,
    pub offset: u64,
    pub structure_stride: u32,
    pub buffer_size: u64,
    pub buffer_format: Format,
    /// Also reserve a slot in the device's bindless pool.
    pub bindless: bool,
}

impl Default for ViewDesc {
    fn default() -> Self {
        Self {
            view_type: ViewType::Unknown,
            dimension: ViewDimension::Unknown,
            base_mip_level: 0,
            level_count: u32::MAX,
            base_array_layer: 0,
            layer_count: u32::MAX,
            plane_slice: 0,
            offset: 0,
            structure_stride: 0,
            buffer_size: u64::MAX,
            buffer_format: Format::Undefined,
            bindless: false,
        }
    }
}

impl ViewDesc {
    pub fn new(view_type: ViewType, dimension: ViewDimension) -> Self {
        Self {
            view_type,
            dimension,
            ..Self::default()
        }
    }

    pub const fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub const fn with_buffer_size(mut self, buffer_size: u64) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub const fn with_structure_stride(mut self, stride: u32) -> Self {
        self.structure_stride = stride;
        self
    }

    pub const fn with_mips(mut self, base_mip_level: u32, level_count: u32) -> Self {
        self.base_mip_level = base_mip_level;
        self.level_count = level_count;
        self
    }

    pub const fn with_layers(mut self, base_array_layer: u32, layer_count: u32) -> Self {
        self.base_array_layer = base_array_layer;
        self.layer_count = layer_count;
        self
    }

    pub const fn with_bindless(mut self, bindless: bool) -> Self {
        self.bindless = bindless;
        self
    }

    /// Bytes covered by a buffer view of a `resource_size`-byte buffer.
    pub const fn buffer_range(&self, resource_size: u64) -> u64 {
        let remaining = resource_size.saturating_sub(self.offset);
        if self.buffer_size < remaining {
            self.buffer_size
        } else {
            remaining
        }
    }
}

/// Mip and layer range a view covers after clamping against its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ViewRange {
    pub fn resolve(desc: &ViewDesc, resource: &dyn Resource) -> Self {
        let levels = u32::from(resource.level_count());
        let layers = u32::from(resource.layer_count());
        let base_mip_level = desc.base_mip_level.min(levels);
        let base_array_layer = desc.base_array_layer.min(layers);
        Self {
            base_mip_level,
            level_count: desc.level_count.min(levels - base_mip_level),
            base_array_layer,
            layer_count: desc.layer_count.min(layers - base_array_layer),
        }
    }
}

/// Typed, immutable accessor over one resource.
pub trait View: QueryInterface {
    fn resource(&self) -> Arc<dyn Resource>;
    fn desc(&self) -> &ViewDesc;
    fn range(&self) -> ViewRange;

    /// Index of this view in its bindless pool.
    ///
    /// Only valid for views created with `bindless = true`; calling it on
    /// any other view is a contract violation.
    fn descriptor_id(&self) -> u32;

    fn base_mip_level(&self) -> u32 {
        self.range().base_mip_level
    }

    fn level_count(&self) -> u32 {
        self.range().level_count
    }

    fn base_array_layer(&self) -> u32 {
        self.range().base_array_layer
    }

    fn layer_count(&self) -> u32 {
        self.range().layer_count
    }
}

/// A caller-managed contiguous range of one bindless pool.
///
/// Shaders index it as `base_descriptor_id() + i`.
pub trait BindlessTypedViewPool: QueryInterface {
    fn view_type(&self) -> ViewType;
    fn base_descriptor_id(&self) -> u32;
    fn view_count(&self) -> u32;

    /// Write `view` into slot `index`; `index >= view_count()` is a
    /// contract violation.
    fn write_view(&self, index: u32, view: &Arc<dyn View>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_desc_covers_everything() {
        let desc = ViewDesc::default();
        assert_eq!(desc.level_count, u32::MAX);
        assert_eq!(desc.layer_count, u32::MAX);
        assert_eq!(desc.buffer_size, u64::MAX);
        assert!(!desc.bindless);
    }

    #[test]
    fn buffer_range_is_clamped_to_resource() {
        let desc = ViewDesc::new(ViewType::Buffer, ViewDimension::Buffer).with_offset(64);
        assert_eq!(desc.buffer_range(256), 192);
        assert_eq!(desc.with_buffer_size(16).buffer_range(256), 16);
        assert_eq!(desc.with_offset(512).buffer_range(256), 0);
    }

    #[test]
    fn shader_visibility() {
        assert!(ViewType::ConstantBuffer.is_shader_visible());
        assert!(ViewType::AccelerationStructure.is_shader_visible());
        assert!(!ViewType::RenderTarget.is_shader_visible());
        assert!(ViewType::RWStructuredBuffer.is_buffer());
        assert!(!ViewType::Texture.is_buffer());
    }
}
