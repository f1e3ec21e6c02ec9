//! Views and bindless typed view pools.

use std::sync::Arc;

use prism_core::interface::cast_arc;
use prism_core::resource::{BindFlag, Resource, ResourceType};
use prism_core::view::{BindlessTypedViewPool, View, ViewDesc, ViewRange, ViewType};
use prism_core::{impl_query_interface, require, Result};

use crate::descriptor::{DescriptorHeaps, HeapAllocation};
use crate::resource::SoftwareResource;

pub struct SoftwareView {
    resource: Arc<SoftwareResource>,
    desc: ViewDesc,
    range: ViewRange,
    bindless: Option<HeapAllocation>,
}

impl_query_interface!(SoftwareView);

fn check_compatible(resource: &SoftwareResource, desc: &ViewDesc) {
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
        ViewType::RWTexture | ViewType::RWBuffer | ViewType::RWStructuredBuffer => BindFlag::UNORDERED_ACCESS,
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

impl SoftwareView {
    /// Create a view, reserving a bindless slot when `desc.bindless` is set.
    pub fn new(resource: Arc<SoftwareResource>, desc: &ViewDesc, heaps: &DescriptorHeaps) -> Result<Arc<Self>> {
        check_compatible(&resource, desc);
        let range = ViewRange::resolve(desc, resource.as_ref());
        let bindless = if desc.bindless {
            require!(
                desc.view_type.is_shader_visible(),
                "{:?} views cannot be bindless",
                desc.view_type
            );
            Some(heaps.allocate_for_view(desc.view_type, 1)?)
        } else {
            None
        };
        let view = Arc::new(Self {
            resource,
            desc: *desc,
            range,
            bindless,
        });
        if let Some(allocation) = &view.bindless {
            allocation.write(0, &view);
        }
        Ok(view)
    }

    pub const fn software_resource(&self) -> &Arc<SoftwareResource> {
        &self.resource
    }

    /// Byte range of a buffer view.
    pub fn buffer_range(&self) -> (u64, u64) {
        (self.desc.offset, self.desc.buffer_range(self.resource.width()))
    }
}

impl View for SoftwareView {
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
            Some(allocation) => allocation.offset(),
            None => prism_core::contract_violation!(
                "descriptor id requested from a {:?} view created without bindless",
                self.desc.view_type
            ),
        }
    }
}

pub struct SoftwareBindlessTypedViewPool {
    view_type: ViewType,
    allocation: HeapAllocation,
}

impl_query_interface!(SoftwareBindlessTypedViewPool);

impl SoftwareBindlessTypedViewPool {
    pub fn new(view_type: ViewType, view_count: u32, heaps: &DescriptorHeaps) -> Result<Arc<Self>> {
        require!(
            view_type.is_shader_visible(),
            "{view_type:?} views cannot live in a bindless pool"
        );
        let allocation = heaps.allocate_for_view(view_type, view_count)?;
        tracing::debug!(
            ?view_type,
            base = allocation.offset(),
            view_count,
            "Bindless view pool created"
        );
        Ok(Arc::new(Self {
            view_type,
            allocation,
        }))
    }

    /// View currently written at `index`, if it is still alive.
    pub fn view(&self, index: u32) -> Option<Arc<SoftwareView>> {
        self.allocation.read(index)
    }
}

impl BindlessTypedViewPool for SoftwareBindlessTypedViewPool {
    fn view_type(&self) -> ViewType {
        self.view_type
    }

    fn base_descriptor_id(&self) -> u32 {
        self.allocation.offset()
    }

    fn view_count(&self) -> u32 {
        self.allocation.size()
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
        let view = cast_arc::<SoftwareView>(Arc::clone(view).into_any());
        self.allocation.write(index, &view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BindingModel;
    use crate::memory::MemoryAccounting;
    use prism_core::format::Format;
    use prism_core::interface::same_object;
    use prism_core::memory::MemoryType;
    use prism_core::resource::{BufferDesc, TextureDesc};
    use prism_core::view::ViewDimension;

    struct Fixture {
        accounting: Arc<MemoryAccounting>,
        heaps: DescriptorHeaps,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                accounting: Arc::new(MemoryAccounting::new(1 << 24)),
                heaps: DescriptorHeaps::new(BindingModel::default()),
            }
        }

        fn texture(&self) -> Arc<SoftwareResource> {
            SoftwareResource::new_texture(
                &TextureDesc::new_2d(Format::Rgba8Unorm, 8, 8, BindFlag::SHADER_RESOURCE).with_mip_levels(4),
                1,
                &self.accounting,
            )
            .unwrap()
        }

        fn buffer(&self) -> Arc<SoftwareResource> {
            SoftwareResource::new_buffer(
                &BufferDesc::new(256, BindFlag::SHADER_RESOURCE, MemoryType::Default),
                2,
                &self.accounting,
            )
            .unwrap()
        }
    }

    #[test]
    fn view_reports_its_resource() {
        let fixture = Fixture::new();
        let texture = fixture.texture();
        let view = SoftwareView::new(
            Arc::clone(&texture),
            &ViewDesc::new(ViewType::Texture, ViewDimension::Texture2D).with_mips(1, u32::MAX),
            &fixture.heaps,
        )
        .unwrap();
        assert!(same_object(&view.resource(), &texture));
        assert_eq!(view.base_mip_level(), 1);
        assert_eq!(view.level_count(), 3);
    }

    #[test]
    fn bindless_views_get_distinct_ids() {
        let fixture = Fixture::new();
        let buffer = fixture.buffer();
        let desc = ViewDesc::new(ViewType::Buffer, ViewDimension::Buffer).with_bindless(true);
        let first = SoftwareView::new(Arc::clone(&buffer), &desc, &fixture.heaps).unwrap();
        let second = SoftwareView::new(buffer, &desc, &fixture.heaps).unwrap();
        assert_ne!(first.descriptor_id(), second.descriptor_id());
    }

    #[test]
    #[should_panic(expected = "created without bindless")]
    fn descriptor_id_requires_bindless() {
        let fixture = Fixture::new();
        let view = SoftwareView::new(
            fixture.buffer(),
            &ViewDesc::new(ViewType::Buffer, ViewDimension::Buffer),
            &fixture.heaps,
        )
        .unwrap();
        let _ = view.descriptor_id();
    }

    #[test]
    #[should_panic(expected = "requires")]
    fn render_target_view_needs_render_target_usage() {
        let fixture = Fixture::new();
        let _ = SoftwareView::new(
            fixture.texture(),
            &ViewDesc::new(ViewType::RenderTarget, ViewDimension::Texture2D),
            &fixture.heaps,
        );
    }

    #[test]
    fn typed_pool_writes_in_range() {
        let fixture = Fixture::new();
        let pool = SoftwareBindlessTypedViewPool::new(ViewType::Texture, 4, &fixture.heaps).unwrap();
        let view: Arc<dyn View> = SoftwareView::new(
            fixture.texture(),
            &ViewDesc::new(ViewType::Texture, ViewDimension::Texture2D),
            &fixture.heaps,
        )
        .unwrap();
        pool.write_view(3, &view);
        assert!(same_object(&pool.view(3).unwrap(), &view));
        assert!(pool.view(0).is_none());
    }

    #[test]
    #[should_panic(expected = "outside a pool")]
    fn typed_pool_rejects_out_of_range_index() {
        let fixture = Fixture::new();
        let pool = SoftwareBindlessTypedViewPool::new(ViewType::Texture, 4, &fixture.heaps).unwrap();
        let view: Arc<dyn View> = SoftwareView::new(
            fixture.texture(),
            &ViewDesc::new(ViewType::Texture, ViewDimension::Texture2D),
            &fixture.heaps,
        )
        .unwrap();
        pool.write_view(4, &view);
    }

    #[test]
    fn dropped_views_leave_empty_slots() {
        let fixture = Fixture::new();
        let pool = SoftwareBindlessTypedViewPool::new(ViewType::Buffer, 1, &fixture.heaps).unwrap();
        let view: Arc<dyn View> = SoftwareView::new(
            fixture.buffer(),
            &ViewDesc::new(ViewType::Buffer, ViewDimension::Buffer),
            &fixture.heaps,
        )
        .unwrap();
        pool.write_view(0, &view);
        drop(view);
        assert!(pool.view(0).is_none());
    }
}
