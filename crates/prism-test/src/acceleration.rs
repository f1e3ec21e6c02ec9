//! Bottom-level build, compaction and instancing into a top-level structure.

use std::sync::Arc;

use glam::{Mat4, Vec3};
use prism::{
    AccelerationStructureType, BindFlag, BuildAccelerationStructureFlags, CommandListType,
    CopyAccelerationStructureMode, Format, GeometryBuffer, MemoryType, QueryHeapType,
    RaytracingAsPrebuildInfo, RaytracingGeometryDesc, RaytracingGeometryInstance, Resource, RhiError,
};
use prism::query::QUERY_RESULT_SIZE;

use crate::harness::TestContext;
use crate::{Result, TestError};

const VERTICES: [[f32; 3]; 4] = [
    [-1.0, -1.0, 0.0],
    [1.0, -1.0, 0.0],
    [1.0, 1.0, 0.0],
    [-1.0, 1.0, 0.0],
];
const INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Sizes observed while building and compacting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub prebuild: RaytracingAsPrebuildInfo,
    pub compacted_size: u64,
    pub top_level: RaytracingAsPrebuildInfo,
}

fn upload_buffer(context: &TestContext, data: &[u8]) -> Result<Arc<dyn Resource>> {
    let buffer = context.buffer(data.len() as u64, BindFlag::RAY_TRACING, MemoryType::Upload)?;
    buffer.update_upload_buffer(0, data)?;
    Ok(buffer)
}

fn structure(
    context: &TestContext,
    as_type: AccelerationStructureType,
    size: u64,
) -> Result<Arc<dyn Resource>> {
    let buffer = context.buffer(size, BindFlag::ACCELERATION_STRUCTURE, MemoryType::Default)?;
    Ok(context.device().create_acceleration_structure(as_type, &buffer, 0)?)
}

/// Build an indexed quad into a bottom-level structure, read its compacted
/// size back through a query heap, compact it, and reference the compacted
/// copy from a two-instance top-level structure.
pub fn build_and_compact(context: &TestContext) -> Result<CompactionReport> {
    let device = context.device();
    if !device.is_dxr_supported() {
        return Err(RhiError::ExtensionNotSupported("ray tracing".to_string()).into());
    }

    let vertex_buffer = upload_buffer(context, bytemuck::cast_slice(&VERTICES))?;
    let index_buffer = upload_buffer(context, bytemuck::cast_slice(&INDICES))?;
    let geometry = RaytracingGeometryDesc {
        vertex: GeometryBuffer::new(&vertex_buffer, Format::Rgb32Float, VERTICES.len() as u32),
        index: GeometryBuffer::new(&index_buffer, Format::R32Uint, INDICES.len() as u32),
        ..RaytracingGeometryDesc::default()
    };
    let flags = BuildAccelerationStructureFlags::ALLOW_COMPACTION
        | BuildAccelerationStructureFlags::PREFER_FAST_TRACE;
    let prebuild = device.blas_prebuild_info(std::slice::from_ref(&geometry), flags);
    if prebuild.acceleration_structure_size == 0 {
        return Err(TestError::Mismatch("bottom-level prebuild info is empty".to_string()));
    }

    let blas = structure(context, AccelerationStructureType::BottomLevel, prebuild.acceleration_structure_size)?;
    blas.set_name("quad blas");
    let scratch = context.buffer(
        prebuild.build_scratch_data_size.max(1),
        BindFlag::UNORDERED_ACCESS,
        MemoryType::Default,
    )?;
    let query_heap = device.create_query_heap(QueryHeapType::AccelerationStructureCompactedSize, 1)?;
    let readback = context.buffer(QUERY_RESULT_SIZE, BindFlag::COPY_DEST, MemoryType::Readback)?;

    let list = device.create_command_list(CommandListType::Compute)?;
    list.set_name("blas build");
    list.build_bottom_level_as(None, &blas, &scratch, 0, &[geometry], flags);
    list.uav_resource_barrier(Some(&blas));
    list.write_acceleration_structures_properties(&[Arc::clone(&blas)], &query_heap, 0);
    list.resolve_query_data(&query_heap, 0, 1, &readback, 0);
    context.submit_and_wait(&list)?;

    let mut compacted = [0; QUERY_RESULT_SIZE as usize];
    readback.read_readback_buffer(0, &mut compacted)?;
    let compacted_size = u64::from_le_bytes(compacted);
    if compacted_size == 0 || compacted_size > prebuild.acceleration_structure_size {
        return Err(TestError::Mismatch(format!(
            "compacted size {compacted_size} outside (0, {}]",
            prebuild.acceleration_structure_size
        )));
    }
    tracing::debug!(
        size = prebuild.acceleration_structure_size,
        compacted_size,
        "Bottom-level structure built"
    );

    let compact = structure(context, AccelerationStructureType::BottomLevel, compacted_size)?;
    compact.set_name("quad blas (compacted)");
    let instances = [
        RaytracingGeometryInstance::new(compact.acceleration_structure_handle())
            .with_transform(&Mat4::from_translation(Vec3::new(-2.0, 0.0, 0.0)))
            .with_instance_id(0),
        RaytracingGeometryInstance::new(compact.acceleration_structure_handle())
            .with_transform(&Mat4::from_translation(Vec3::new(2.0, 0.0, 0.0)))
            .with_instance_id(1),
    ];
    let instance_buffer = upload_buffer(context, bytemuck::cast_slice(&instances))?;
    let top_level = device.tlas_prebuild_info(instances.len() as u32, BuildAccelerationStructureFlags::empty());
    let tlas = structure(context, AccelerationStructureType::TopLevel, top_level.acceleration_structure_size)?;
    tlas.set_name("scene tlas");
    let tlas_scratch = context.buffer(
        top_level.build_scratch_data_size.max(1),
        BindFlag::UNORDERED_ACCESS,
        MemoryType::Default,
    )?;

    let list = device.create_command_list(CommandListType::Compute)?;
    list.set_name("compaction and tlas build");
    list.copy_acceleration_structure(&blas, &compact, CopyAccelerationStructureMode::Compact);
    list.uav_resource_barrier(None);
    list.build_top_level_as(
        None,
        &tlas,
        &tlas_scratch,
        0,
        &instance_buffer,
        0,
        instances.len() as u32,
        BuildAccelerationStructureFlags::empty(),
    );
    context.submit_and_wait(&list)?;

    Ok(CompactionReport {
        prebuild,
        compacted_size,
        top_level,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use prism::software::{SoftwareDeviceConfig, SoftwareFeatures, SoftwareInstance};
    use prism::{DeviceConfig, InstanceConfig};

    use super::*;
    use crate::harness::TestBackend;

    #[test]
    fn compaction_on_both_binding_models() {
        for backend in [TestBackend::root_tables(), TestBackend::descriptor_sets()] {
            let context = TestContext::new(backend).unwrap();
            let report = build_and_compact(&context).unwrap();
            assert!(report.compacted_size <= report.prebuild.acceleration_structure_size);
            assert!(report.top_level.acceleration_structure_size > 0);
            context.ensure_no_validation_errors().unwrap();
        }
    }

    #[test]
    fn instance_transforms_are_row_major() {
        let instance = RaytracingGeometryInstance::new(7)
            .with_transform(&Mat4::from_translation(Vec3::new(-2.0, 0.5, 3.0)));
        assert_relative_eq!(instance.transform[0][3], -2.0);
        assert_relative_eq!(instance.transform[1][3], 0.5);
        assert_relative_eq!(instance.transform[2][3], 3.0);
        assert_relative_eq!(instance.transform[0][0], 1.0);
    }

    #[test]
    fn devices_without_ray_tracing_report_it() {
        let features = SoftwareFeatures {
            ray_tracing: false,
            ..SoftwareFeatures::default()
        };
        let instance: Arc<dyn prism::Instance> = Arc::new(SoftwareInstance::with_device_config(
            &InstanceConfig::default(),
            SoftwareDeviceConfig::default().with_features(features),
        ));
        let device = prism::create_device(&instance, &DeviceConfig::default()).unwrap();
        assert!(!device.is_dxr_supported());
        assert!(device.is_ray_query_supported());
    }

    #[cfg(feature = "vulkan")]
    #[test]
    #[ignore = "Requires GPU hardware"]
    fn vulkan_compaction() {
        let context = TestContext::new(TestBackend::Vulkan).unwrap();
        if !context.device().is_dxr_supported() {
            return;
        }
        let report = build_and_compact(&context).unwrap();
        assert!(report.compacted_size <= report.prebuild.acceleration_structure_size);
        context.ensure_no_validation_errors().unwrap();
    }
}
