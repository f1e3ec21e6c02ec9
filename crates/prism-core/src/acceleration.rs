//! Ray-tracing acceleration structures: geometry, instances and build inputs.

use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::format::Format;
use crate::resource::Resource;

/// Required alignment of an acceleration structure inside its buffer.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureType {
    TopLevel,
    BottomLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RaytracingGeometryFlags {
    #[default]
    None,
    Opaque,
    NoDuplicateAnyHitInvocation,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RaytracingInstanceFlags: u32 {
        const TRIANGLE_CULL_DISABLE = 0x1;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NON_OPAQUE = 0x8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuildAccelerationStructureFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const MINIMIZE_MEMORY = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyAccelerationStructureMode {
    Clone,
    Compact,
}

/// Vertex or index data feeding a bottom-level build.
#[derive(Clone, Default)]
pub struct GeometryBuffer {
    pub resource: Option<Arc<dyn Resource>>,
    pub format: Format,
    pub count: u32,
    /// Byte offset into `resource`.
    pub offset: u64,
}

impl GeometryBuffer {
    pub fn new(resource: &Arc<dyn Resource>, format: Format, count: u32) -> Self {
        Self {
            resource: Some(Arc::clone(resource)),
            format,
            count,
            offset: 0,
        }
    }

    pub const fn stride(&self) -> u64 {
        self.format.block_size() as u64
    }
}

/// One triangle geometry of a bottom-level structure.
#[derive(Clone, Default)]
pub struct RaytracingGeometryDesc {
    pub vertex: GeometryBuffer,
    pub index: GeometryBuffer,
    pub flags: RaytracingGeometryFlags,
}

impl RaytracingGeometryDesc {
    pub const fn is_indexed(&self) -> bool {
        self.index.resource.is_some()
    }

    /// Triangles built from this geometry.
    pub const fn primitive_count(&self) -> u32 {
        if self.is_indexed() {
            self.index.count / 3
        } else {
            self.vertex.count / 3
        }
    }
}

/// Sizes a build needs, queried before allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RaytracingAsPrebuildInfo {
    pub acceleration_structure_size: u64,
    pub build_scratch_data_size: u64,
    pub update_scratch_data_size: u64,
}

/// Top-level instance record as consumed by the hardware.
///
/// 64 bytes: a row-major 3x4 transform, a 24-bit instance id with an 8-bit
/// mask, a 24-bit hit-group offset with 8 bits of flags, and the handle of
/// the referenced bottom-level structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RaytracingGeometryInstance {
    pub transform: [[f32; 4]; 3],
    instance_id_and_mask: u32,
    instance_offset_and_flags: u32,
    pub acceleration_structure_handle: u64,
}

const LOW_24: u32 = 0x00ff_ffff;

impl RaytracingGeometryInstance {
    /// Identity-transformed instance visible to every ray mask.
    pub const fn new(acceleration_structure_handle: u64) -> Self {
        Self {
            transform: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            instance_id_and_mask: 0xff << 24,
            instance_offset_and_flags: 0,
            acceleration_structure_handle,
        }
    }

    /// Use the upper 3x4 part of `transform`.
    pub fn with_transform(mut self, transform: &glam::Mat4) -> Self {
        self.transform = [
            transform.row(0).to_array(),
            transform.row(1).to_array(),
            transform.row(2).to_array(),
        ];
        self
    }

    pub const fn with_instance_id(mut self, instance_id: u32) -> Self {
        self.instance_id_and_mask = (self.instance_id_and_mask & !LOW_24) | (instance_id & LOW_24);
        self
    }

    pub const fn with_mask(mut self, mask: u8) -> Self {
        self.instance_id_and_mask = (self.instance_id_and_mask & LOW_24) | ((mask as u32) << 24);
        self
    }

    pub const fn with_instance_offset(mut self, offset: u32) -> Self {
        self.instance_offset_and_flags =
            (self.instance_offset_and_flags & !LOW_24) | (offset & LOW_24);
        self
    }

    pub const fn with_flags(mut self, flags: RaytracingInstanceFlags) -> Self {
        self.instance_offset_and_flags =
            (self.instance_offset_and_flags & LOW_24) | ((flags.bits() & 0xff) << 24);
        self
    }

    pub const fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & LOW_24
    }

    pub const fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub const fn instance_offset(&self) -> u32 {
        self.instance_offset_and_flags & LOW_24
    }

    pub const fn flags(&self) -> RaytracingInstanceFlags {
        RaytracingInstanceFlags::from_bits_truncate(self.instance_offset_and_flags >> 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn instance_record_is_64_bytes() {
        assert_eq!(std::mem::size_of::<RaytracingGeometryInstance>(), 64);
        assert_eq!(std::mem::align_of::<RaytracingGeometryInstance>(), 8);
    }

    #[test]
    fn packed_fields_do_not_overlap() {
        let instance = RaytracingGeometryInstance::new(0xdead_beef)
            .with_instance_id(0x0123_4567)
            .with_mask(0x0f)
            .with_instance_offset(7)
            .with_flags(RaytracingInstanceFlags::FORCE_OPAQUE);
        assert_eq!(instance.instance_id(), 0x0023_4567);
        assert_eq!(instance.mask(), 0x0f);
        assert_eq!(instance.instance_offset(), 7);
        assert_eq!(instance.flags(), RaytracingInstanceFlags::FORCE_OPAQUE);
        assert_eq!(instance.acceleration_structure_handle, 0xdead_beef);
    }

    #[test]
    fn transform_is_row_major() {
        let translation = glam::Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        let instance = RaytracingGeometryInstance::new(0).with_transform(&translation);
        assert_relative_eq!(instance.transform[0][3], 1.0);
        assert_relative_eq!(instance.transform[1][3], 2.0);
        assert_relative_eq!(instance.transform[2][3], 3.0);
        assert_relative_eq!(instance.transform[2][2], 1.0);
    }

    #[test]
    fn primitive_count_prefers_indices() {
        let unindexed = RaytracingGeometryDesc {
            vertex: GeometryBuffer {
                count: 9,
                format: Format::Rgb32Float,
                ..GeometryBuffer::default()
            },
            ..RaytracingGeometryDesc::default()
        };
        assert_eq!(unindexed.primitive_count(), 3);
        assert_eq!(unindexed.vertex.stride(), 12);
    }
}
