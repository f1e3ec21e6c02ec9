//! Resource states to image layouts and synchronization2 barriers.
//!
//! Buffers carry no layout; their transitions collapse into one global
//! memory barrier. Image transitions whose layouts coincide are skipped.
//! Stages are always `ALL_COMMANDS`; access masks follow from the layouts.

use ash::vk;
use prism_core::state::{ResourceBarrierDesc, ResourceState};

/// Layout an image must be in while it is used in `state`.
pub fn image_layout(state: ResourceState) -> vk::ImageLayout {
    const LAYOUTS: [(ResourceState, vk::ImageLayout); 12] = [
        (ResourceState::UNDEFINED, vk::ImageLayout::UNDEFINED),
        (ResourceState::PRESENT, vk::ImageLayout::PRESENT_SRC_KHR),
        (ResourceState::RENDER_TARGET, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        (
            ResourceState::DEPTH_STENCIL_WRITE,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        (
            ResourceState::DEPTH_STENCIL_READ,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        (ResourceState::UNORDERED_ACCESS, vk::ImageLayout::GENERAL),
        (ResourceState::COPY_DEST, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        (ResourceState::COPY_SOURCE, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        (
            ResourceState::SHADING_RATE_SOURCE,
            vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR,
        ),
        (
            ResourceState::PIXEL_SHADER_RESOURCE,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        (
            ResourceState::NON_PIXEL_SHADER_RESOURCE,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        (ResourceState::COMMON, vk::ImageLayout::GENERAL),
    ];

    if state == ResourceState::GENERIC_READ {
        return vk::ImageLayout::GENERAL;
    }
    LAYOUTS
        .iter()
        .find(|(candidate, _)| state.contains(*candidate))
        .map_or(vk::ImageLayout::GENERAL, |(_, layout)| *layout)
}

/// Accesses an image in `layout` may see.
pub fn layout_access(layout: vk::ImageLayout) -> vk::AccessFlags2 {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags2::NONE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags2::SHADER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags2::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR => {
            vk::AccessFlags2::FRAGMENT_SHADING_RATE_ATTACHMENT_READ_KHR
        }
        _ => vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
    }
}

/// Native barrier for an image transition, or `None` when the layouts match.
pub fn image_barrier(
    barrier: &ResourceBarrierDesc,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
) -> Option<vk::ImageMemoryBarrier2<'static>> {
    let old_layout = image_layout(barrier.state_before);
    let new_layout = image_layout(barrier.state_after);
    if old_layout == new_layout {
        return None;
    }
    Some(
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(layout_access(old_layout))
            .dst_access_mask(layout_access(new_layout))
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: barrier.base_mip_level,
                level_count: barrier.level_count,
                base_array_layer: barrier.base_array_layer,
                layer_count: barrier.layer_count,
            }),
    )
}

/// Global barrier standing in for buffer and acceleration-structure
/// transitions.
pub fn buffer_barrier() -> vk::MemoryBarrier2<'static> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
}

/// Global barrier ordering shader and acceleration-structure accesses.
pub fn uav_barrier() -> vk::MemoryBarrier2<'static> {
    let access = vk::AccessFlags2::SHADER_READ
        | vk::AccessFlags2::SHADER_WRITE
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR;
    vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(access)
        .dst_access_mask(access)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_of_common_states() {
        assert_eq!(image_layout(ResourceState::PRESENT), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            image_layout(ResourceState::RENDER_TARGET),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(image_layout(ResourceState::COMMON), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(ResourceState::UNDEFINED), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            image_layout(ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn write_layouts_allow_writes() {
        let access = layout_access(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert!(access.contains(vk::AccessFlags2::TRANSFER_WRITE));
        assert_eq!(
            layout_access(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AccessFlags2::NONE
        );
    }

    #[test]
    fn uav_barrier_covers_acceleration_structures() {
        let barrier = uav_barrier();
        assert!(barrier
            .dst_access_mask
            .contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR));
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::ALL_COMMANDS);
    }

    #[test]
    fn equal_layouts_need_no_image_barrier() {
        let desc = ResourceBarrierDesc {
            resource: dummy_resource(),
            state_before: ResourceState::PIXEL_SHADER_RESOURCE,
            state_after: ResourceState::NON_PIXEL_SHADER_RESOURCE,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        assert!(image_barrier(&desc, vk::Image::null(), vk::ImageAspectFlags::COLOR).is_none());

        let desc = ResourceBarrierDesc {
            state_after: ResourceState::COPY_SOURCE,
            ..desc
        };
        let barrier = image_barrier(&desc, vk::Image::null(), vk::ImageAspectFlags::COLOR).unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::TRANSFER_READ);
    }

    fn dummy_resource() -> std::sync::Arc<dyn prism_core::resource::Resource> {
        use prism_core::memory::{Memory, MemoryRequirements, MemoryType};
        use prism_core::resource::{BufferDesc, BindFlag, Resource, ResourceBase};

        struct Dummy(ResourceBase);
        prism_core::impl_query_interface!(Dummy);
        impl Resource for Dummy {
            fn base(&self) -> &ResourceBase {
                &self.0
            }
            fn commit_memory(&self, _: MemoryType) -> prism_core::Result<()> {
                Ok(())
            }
            fn bind_memory(&self, _: &std::sync::Arc<dyn Memory>, _: u64) -> prism_core::Result<()> {
                Ok(())
            }
            fn memory_requirements(&self) -> MemoryRequirements {
                MemoryRequirements::default()
            }
            fn map(&self) -> prism_core::Result<std::ptr::NonNull<u8>> {
                Err(prism_core::RhiError::InvalidState("not mappable".into()))
            }
            fn unmap(&self) {}
        }
        std::sync::Arc::new(Dummy(ResourceBase::buffer(&BufferDesc::placed(4, BindFlag::empty()))))
    }
}
