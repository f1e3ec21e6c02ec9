//! Acceleration-structure sizing and the header written into built
//! structures.

use prism_core::acceleration::{
    AccelerationStructureType, BuildAccelerationStructureFlags, RaytracingAsPrebuildInfo,
    RaytracingGeometryDesc,
};
use prism_core::memory::align_up;

const HEADER_RESERVE: u64 = 256;
const SIZE_ALIGNMENT: u64 = 256;

const BLAS_BYTES_PER_PRIMITIVE: u64 = 64;
const BLAS_SCRATCH_BYTES_PER_PRIMITIVE: u64 = 128;
const BLAS_COMPACTED_BYTES_PER_PRIMITIVE: u64 = 48;
const TLAS_BYTES_PER_INSTANCE: u64 = 64;

/// Bytes at the start of a built structure identifying what was built.
pub const HEADER_SIZE: u64 = 16;
const HEADER_MAGIC: [u8; 4] = *b"PRSM";

const fn sized(per_element: u64, count: u64) -> u64 {
    align_up(HEADER_RESERVE + per_element * count, SIZE_ALIGNMENT)
}

pub fn primitive_count(descs: &[RaytracingGeometryDesc]) -> u64 {
    descs.iter().map(|desc| u64::from(desc.primitive_count())).sum()
}

pub const fn blas_prebuild_info(primitive_count: u64) -> RaytracingAsPrebuildInfo {
    RaytracingAsPrebuildInfo {
        acceleration_structure_size: sized(BLAS_BYTES_PER_PRIMITIVE, primitive_count),
        build_scratch_data_size: sized(BLAS_SCRATCH_BYTES_PER_PRIMITIVE, primitive_count),
        update_scratch_data_size: sized(BLAS_BYTES_PER_PRIMITIVE, primitive_count),
    }
}

pub const fn blas_compacted_size(primitive_count: u64) -> u64 {
    sized(BLAS_COMPACTED_BYTES_PER_PRIMITIVE, primitive_count)
}

pub const fn tlas_prebuild_info(instance_count: u64) -> RaytracingAsPrebuildInfo {
    let size = sized(TLAS_BYTES_PER_INSTANCE, instance_count);
    RaytracingAsPrebuildInfo {
        acceleration_structure_size: size,
        build_scratch_data_size: size,
        update_scratch_data_size: size,
    }
}

/// Header stored in the first [`HEADER_SIZE`] bytes of a built structure.
pub fn encode_header(
    as_type: AccelerationStructureType,
    element_count: u32,
    flags: BuildAccelerationStructureFlags,
) -> [u8; HEADER_SIZE as usize] {
    let type_tag: u32 = match as_type {
        AccelerationStructureType::TopLevel => 0,
        AccelerationStructureType::BottomLevel => 1,
    };
    let mut header = [0; HEADER_SIZE as usize];
    header[..4].copy_from_slice(&HEADER_MAGIC);
    header[4..8].copy_from_slice(&type_tag.to_le_bytes());
    header[8..12].copy_from_slice(&element_count.to_le_bytes());
    header[12..16].copy_from_slice(&flags.bits().to_le_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compacted_never_exceeds_full_size() {
        for primitives in [0, 1, 3, 100, 4096] {
            let info = blas_prebuild_info(primitives);
            assert!(blas_compacted_size(primitives) <= info.acceleration_structure_size);
            assert_eq!(info.acceleration_structure_size % SIZE_ALIGNMENT, 0);
            assert!(info.build_scratch_data_size >= info.update_scratch_data_size);
        }
    }

    #[test]
    fn one_triangle_sizes() {
        let info = blas_prebuild_info(1);
        assert_eq!(info.acceleration_structure_size, 512);
        assert_eq!(info.build_scratch_data_size, 512);
        assert_eq!(blas_compacted_size(1), 512);
        assert_eq!(tlas_prebuild_info(1).acceleration_structure_size, 512);
        assert_eq!(blas_prebuild_info(10).acceleration_structure_size, 1024);
        assert_eq!(blas_compacted_size(10), 768);
    }

    #[test]
    fn header_is_tagged() {
        let header = encode_header(
            AccelerationStructureType::BottomLevel,
            7,
            BuildAccelerationStructureFlags::ALLOW_COMPACTION,
        );
        assert_eq!(&header[..4], b"PRSM");
        assert_eq!(u32::from_le_bytes(header[8..12].try_into().unwrap()), 7);
    }
}
