//! Image views, buffer views and bindless typed view pools.

use std::sync::Arc;

use ash::vk;
use prism_core::descriptor_pool::DescriptorRange;
use prism_core::format::Format;
use prism_core::interface::cast_arc;
use prism_core::layout::descriptor_set::DescriptorKind;
use prism_core::resource::{BindFlag, Resource, ResourceType};
use prism_core::view::{BindlessTypedViewPool, View, ViewDesc, ViewDimension, ViewRange, ViewType};
use prism_core::{impl_query_interface, require, Result};

use crate::context::DeviceContext;
use crate::descriptor::{BindlessPool, DescriptorWrite};
use crate::error::VulkanError;
use crate::format::to_vk_format;
use crate::resource::VulkanResource;

fn check_compatible(resource: &VulkanResource, desc: &ViewDesc) {
    let resource_type = resource.resource_type();
    let expected = match desc.view_type {
        ViewType::Unknown => prism_core::contract_violation!("views need a concrete view type"),
        ViewType::Sampler => ResourceType::Sampler,
        ViewType::AccelerationStructure => ResourceType::AccelerationStructure,
        view_type if view_type.is_buffer() => ResourceType::Buffer,
        _ => ResourceType::Texture,
    };
    require!(
        resource_type == expected,
        "{:?} view over a {resource_type:?} resource",
        desc.view_type
    );
    let required_flag = match desc.view_type {
        ViewType::RenderTarget => BindFlag::RENDER_TARGET,
        ViewType::DepthStencil => BindFlag::DEPTH_STENCIL,
        ViewType::RWTexture | ViewType::RWBuffer | ViewType::RWStructuredBuffer => {
            BindFlag::UNORDERED_ACCESS
        }
        ViewType::ShadingRateSource => BindFlag::SHADING_RATE_SOURCE,
        _ => BindFlag::empty(),
    };
    require!(
        resource.bind_flags().contains(required_flag),
        "{:?} view requires {required_flag:?} usage",
        desc.view_type
    );
    if desc.view_type.is_buffer() {
        require!(
            desc.offset <= resource.width(),
            "view offset {} past the end of a {}-byte buffer",
            desc.offset,
            resource.width()
        );
    }
}

fn image_view_type(dimension: ViewDimension, resource: &VulkanResource) -> vk::ImageViewType {
    match dimension {
        ViewDimension::Texture1D => vk::ImageViewType::TYPE_1D,
        ViewDimension::Texture1DArray => vk::ImageViewType::TYPE_1D_ARRAY,
        ViewDimension::Texture2D | ViewDimension::Texture2DMS => vk::ImageViewType::TYPE_2D,
        ViewDimension::Texture2DArray | ViewDimension::Texture2DMSArray => {
            vk::ImageViewType::TYPE_2D_ARRAY
        }
        ViewDimension::Texture3D => vk::ImageViewType::TYPE_3D,
        ViewDimension::TextureCube => vk::ImageViewType::CUBE,
        ViewDimension::TextureCubeArray => vk::ImageViewType::CUBE_ARRAY,
        ViewDimension::Unknown | ViewDimension::Buffer => {
            if resource.layer_count() > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            }
        }
    }
}

/// Aspect a view reads; sampled depth-stencil textures see depth only.
fn view_aspect(view_type: ViewType, format: Format, full: vk::ImageAspectFlags) -> vk::ImageAspectFlags {
    if view_type == ViewType::Texture && format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        full
    }
}

pub struct VulkanView {
    context: Arc<DeviceContext>,
    resource: Arc<VulkanResource>,
    desc: ViewDesc,
    range: ViewRange,
    image_view: vk::ImageView,
    buffer_view: vk::BufferView,
    descriptor: Option<DescriptorWrite>,
    /// Slot in the device-wide pool; released when the view drops.
    bindless: Option<DescriptorRange>,
}

impl_query_interface!(VulkanView);

impl VulkanView {
    pub fn new(
        context: &Arc<DeviceContext>,
        resource: Arc<VulkanResource>,
        desc: &ViewDesc,
    ) -> Result<Arc<Self>> {
        check_compatible(&resource, desc);
        let range = ViewRange::resolve(desc, resource.as_ref());
        let mut view = Self {
            context: Arc::clone(context),
            resource,
            desc: *desc,
            range,
            image_view: vk::ImageView::null(),
            buffer_view: vk::BufferView::null(),
            descriptor: None,
            bindless: None,
        };
        view.create_native()?;

        if desc.bindless {
            require!(
                desc.view_type.is_shader_visible(),
                "{:?} views cannot be bindless",
                desc.view_type
            );
            let pool = context.bindless_pool(DescriptorKind::of(desc.view_type))?;
            let range = pool.allocate(1)?;
            if let Some(descriptor) = &view.descriptor {
                pool.with_storage(|storage| storage.write(range.offset(), descriptor));
            }
            view.bindless = Some(range);
        }
        Ok(Arc::new(view))
    }

    fn create_native(&mut self) -> Result<()> {
        let device = &self.context.device;
        match self.desc.view_type {
            ViewType::Texture
            | ViewType::RWTexture
            | ViewType::RenderTarget
            | ViewType::DepthStencil
            | ViewType::ShadingRateSource => {
                let (image, format, aspect) = self.resource.image();
                let create_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(image_view_type(self.desc.dimension, &self.resource))
                    .format(format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: view_aspect(self.desc.view_type, self.resource.format(), aspect),
                        base_mip_level: self.range.base_mip_level,
                        level_count: self.range.level_count,
                        base_array_layer: self.range.base_array_layer,
                        layer_count: self.range.layer_count,
                    });
                self.image_view = unsafe { device.create_image_view(&create_info, None) }
                    .map_err(VulkanError::from)?;
                let layout = match self.desc.view_type {
                    ViewType::Texture => Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                    ViewType::RWTexture => Some(vk::ImageLayout::GENERAL),
                    _ => None,
                };
                self.descriptor = layout.map(|layout| {
                    DescriptorWrite::Image(
                        vk::DescriptorImageInfo::default()
                            .image_view(self.image_view)
                            .image_layout(layout),
                    )
                });
            }
            ViewType::Buffer | ViewType::RWBuffer => {
                require!(
                    self.desc.buffer_format != Format::Undefined,
                    "typed buffer views need a buffer format"
                );
                let (offset, size) = self.buffer_range();
                let create_info = vk::BufferViewCreateInfo::default()
                    .buffer(self.resource.buffer())
                    .format(to_vk_format(self.desc.buffer_format))
                    .offset(offset)
                    .range(size);
                self.buffer_view = unsafe { device.create_buffer_view(&create_info, None) }
                    .map_err(VulkanError::from)?;
                self.descriptor = Some(DescriptorWrite::TexelBuffer(self.buffer_view));
            }
            ViewType::ConstantBuffer | ViewType::StructuredBuffer | ViewType::RWStructuredBuffer => {
                let (offset, size) = self.buffer_range();
                self.descriptor = Some(DescriptorWrite::Buffer(vk::DescriptorBufferInfo {
                    buffer: self.resource.buffer(),
                    offset,
                    range: size,
                }));
            }
            ViewType::Sampler => {
                self.descriptor = Some(DescriptorWrite::Image(
                    vk::DescriptorImageInfo::default().sampler(self.resource.sampler()),
                ));
            }
            ViewType::AccelerationStructure => {
                self.descriptor = Some(DescriptorWrite::AccelerationStructure(
                    self.resource.acceleration_structure().handle,
                ));
            }
            ViewType::Unknown => prism_core::contract_violation!("views need a concrete view type"),
        }
        Ok(())
    }

    pub const fn vulkan_resource(&self) -> &Arc<VulkanResource> {
        &self.resource
    }

    /// Attachment image view; null for buffer, sampler and AS views.
    pub const fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    /// Native descriptor contents, for views shaders can see.
    pub fn descriptor(&self) -> DescriptorWrite {
        match self.descriptor {
            Some(descriptor) => descriptor,
            None => prism_core::contract_violation!(
                "{:?} views cannot be written to a descriptor",
                self.desc.view_type
            ),
        }
    }

    /// Byte range of a buffer view.
    pub fn buffer_range(&self) -> (u64, u64) {
        (self.desc.offset, self.desc.buffer_range(self.resource.width()))
    }
}

impl View for VulkanView {
    fn resource(&self) -> Arc<dyn Resource> {
        Arc::clone(&self.resource) as Arc<dyn Resource>
    }

    fn desc(&self) -> &ViewDesc {
        &self.desc
    }

    fn range(&self) -> ViewRange {
        self.range
    }

    fn descriptor_id(&self) -> u32 {
        match &self.bindless {
            Some(range) => range.offset(),
            None => prism_core::contract_violation!(
                "descriptor id requested from a {:?} view created without bindless",
                self.desc.view_type
            ),
        }
    }
}

impl Drop for VulkanView {
    fn drop(&mut self) {
        unsafe {
            if self.image_view != vk::ImageView::null() {
                self.context.device.destroy_image_view(self.image_view, None);
            }
            if self.buffer_view != vk::BufferView::null() {
                self.context.device.destroy_buffer_view(self.buffer_view, None);
            }
        }
    }
}

/// A contiguous range of one device-wide bindless pool.
pub struct VulkanBindlessTypedViewPool {
    view_type: ViewType,
    pool: Arc<BindlessPool>,
    range: DescriptorRange,
    views: parking_lot::Mutex<Vec<Option<Arc<VulkanView>>>>,
}

impl_query_interface!(VulkanBindlessTypedViewPool);

impl VulkanBindlessTypedViewPool {
    pub fn new(context: &DeviceContext, view_type: ViewType, view_count: u32) -> Result<Arc<Self>> {
        require!(
            view_type.is_shader_visible(),
            "{view_type:?} views cannot live in a bindless pool"
        );
        let pool = context.bindless_pool(DescriptorKind::of(view_type))?;
        let range = pool.allocate(view_count)?;
        tracing::debug!(
            ?view_type,
            base = range.offset(),
            view_count,
            "Bindless view pool created"
        );
        Ok(Arc::new(Self {
            view_type,
            pool,
            range,
            views: parking_lot::Mutex::new(vec![None; view_count as usize]),
        }))
    }
}

impl BindlessTypedViewPool for VulkanBindlessTypedViewPool {
    fn view_type(&self) -> ViewType {
        self.view_type
    }

    fn base_descriptor_id(&self) -> u32 {
        self.range.offset()
    }

    fn view_count(&self) -> u32 {
        self.range.size()
    }

    fn write_view(&self, index: u32, view: &Arc<dyn View>) {
        require!(
            index < self.view_count(),
            "view index {index} outside a pool of {} views",
            self.view_count()
        );
        require!(
            view.desc().view_type == self.view_type,
            "{:?} view written to a {:?} pool",
            view.desc().view_type,
            self.view_type
        );
        let view = cast_arc::<VulkanView>(Arc::clone(view).into_any());
        let descriptor = view.descriptor();
        self.pool
            .with_storage(|storage| storage.write(self.range.offset() + index, &descriptor));
        // Native descriptors reference the view's handles; keep it alive.
        self.views.lock()[index as usize] = Some(view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampled_depth_reads_depth_aspect() {
        let full = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
        assert_eq!(
            view_aspect(ViewType::Texture, Format::D24UnormS8Uint, full),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(view_aspect(ViewType::DepthStencil, Format::D24UnormS8Uint, full), full);
        assert_eq!(
            view_aspect(ViewType::Texture, Format::Rgba8Unorm, vk::ImageAspectFlags::COLOR),
            vk::ImageAspectFlags::COLOR
        );
    }
}
