//! Acceleration-structure build inputs shared by prebuild queries and
//! command recording.

use ash::vk;
use prism_core::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, GeometryBuffer,
    RaytracingAsPrebuildInfo, RaytracingGeometryDesc, RaytracingGeometryFlags,
};
use prism_core::{Result, RhiError};

use crate::context::DeviceContext;
use crate::format::{index_type, to_vk_format};
use crate::resource::vulkan_resource;

pub const fn acceleration_structure_type(
    as_type: AccelerationStructureType,
) -> vk::AccelerationStructureTypeKHR {
    match as_type {
        AccelerationStructureType::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        AccelerationStructureType::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
    }
}

pub fn build_flags(flags: BuildAccelerationStructureFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    const FLAGS: [(BuildAccelerationStructureFlags, vk::BuildAccelerationStructureFlagsKHR); 5] = [
        (
            BuildAccelerationStructureFlags::ALLOW_UPDATE,
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
        ),
        (
            BuildAccelerationStructureFlags::ALLOW_COMPACTION,
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
        ),
        (
            BuildAccelerationStructureFlags::PREFER_FAST_TRACE,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        ),
        (
            BuildAccelerationStructureFlags::PREFER_FAST_BUILD,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
        ),
        (
            BuildAccelerationStructureFlags::MINIMIZE_MEMORY,
            vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY,
        ),
    ];
    FLAGS
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .fold(vk::BuildAccelerationStructureFlagsKHR::empty(), |acc, (_, native)| {
            acc | *native
        })
}

const fn geometry_flags(flags: RaytracingGeometryFlags) -> vk::GeometryFlagsKHR {
    match flags {
        RaytracingGeometryFlags::None => vk::GeometryFlagsKHR::empty(),
        RaytracingGeometryFlags::Opaque => vk::GeometryFlagsKHR::OPAQUE,
        RaytracingGeometryFlags::NoDuplicateAnyHitInvocation => {
            vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION
        }
    }
}

/// Where addresses of geometry buffers come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addresses {
    /// Size queries ignore addresses.
    Ignored,
    /// Builds read the bound buffers.
    Resolved,
}

fn geometry_address(buffer: &GeometryBuffer, addresses: Addresses) -> vk::DeviceOrHostAddressConstKHR {
    let device_address = match (&buffer.resource, addresses) {
        (Some(resource), Addresses::Resolved) => {
            vulkan_resource(resource).device_address() + buffer.offset
        }
        _ => 0,
    };
    vk::DeviceOrHostAddressConstKHR { device_address }
}

/// Triangle geometries of a bottom-level build.
pub fn bottom_level_geometries(
    descs: &[RaytracingGeometryDesc],
    addresses: Addresses,
) -> Vec<vk::AccelerationStructureGeometryKHR<'static>> {
    descs
        .iter()
        .map(|desc| {
            let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(to_vk_format(desc.vertex.format))
                .vertex_data(geometry_address(&desc.vertex, addresses))
                .vertex_stride(desc.vertex.stride())
                .max_vertex(desc.vertex.count.saturating_sub(1))
                .index_type(vk::IndexType::NONE_KHR);
            if desc.is_indexed() {
                triangles = triangles
                    .index_type(index_type(desc.index.format))
                    .index_data(geometry_address(&desc.index, addresses));
            }
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(geometry_flags(desc.flags))
        })
        .collect()
}

/// The single instance geometry of a top-level build.
pub fn top_level_geometry(instances_address: u64) -> vk::AccelerationStructureGeometryKHR<'static> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instances_address,
        });
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
}

/// Sizes of a build over `geometries` with `primitive_counts` per geometry.
pub fn prebuild_info(
    context: &DeviceContext,
    as_type: AccelerationStructureType,
    geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
    primitive_counts: &[u32],
    flags: BuildAccelerationStructureFlags,
) -> Result<RaytracingAsPrebuildInfo> {
    let Some(loader) = &context.acceleration_structure_loader else {
        return Err(RhiError::ExtensionNotSupported(
            "VK_KHR_acceleration_structure".to_string(),
        ));
    };
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(acceleration_structure_type(as_type))
        .flags(build_flags(flags))
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries);
    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            primitive_counts,
            &mut sizes,
        );
    }
    Ok(RaytracingAsPrebuildInfo {
        acceleration_structure_size: sizes.acceleration_structure_size,
        build_scratch_data_size: sizes.build_scratch_size,
        update_scratch_data_size: sizes.update_scratch_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::format::Format;

    #[test]
    fn minimize_memory_is_low_memory() {
        let flags = build_flags(
            BuildAccelerationStructureFlags::ALLOW_COMPACTION
                | BuildAccelerationStructureFlags::MINIMIZE_MEMORY,
        );
        assert_eq!(
            flags,
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
                | vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY
        );
        assert!(build_flags(BuildAccelerationStructureFlags::empty()).is_empty());
    }

    #[test]
    fn unindexed_geometry_has_no_index_type() {
        let desc = RaytracingGeometryDesc {
            vertex: GeometryBuffer {
                resource: None,
                format: Format::Rgb32Float,
                count: 3,
                offset: 0,
            },
            flags: RaytracingGeometryFlags::Opaque,
            ..RaytracingGeometryDesc::default()
        };
        let geometries = bottom_level_geometries(&[desc], Addresses::Ignored);
        assert_eq!(geometries.len(), 1);
        assert_eq!(geometries[0].flags, vk::GeometryFlagsKHR::OPAQUE);
        let triangles = unsafe { geometries[0].geometry.triangles };
        assert_eq!(triangles.index_type, vk::IndexType::NONE_KHR);
        assert_eq!(triangles.vertex_stride, 12);
        assert_eq!(triangles.max_vertex, 2);
        assert_eq!(triangles.vertex_format, vk::Format::R32G32B32_SFLOAT);
    }
}
