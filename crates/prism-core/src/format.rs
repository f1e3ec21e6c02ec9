//! Pixel and vertex formats.

/// Texel, vertex attribute and index formats understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Format {
    #[default]
    Undefined,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R8Uint,
    R16Uint,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    Rgba32Uint,
    D16Unorm,
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
    Bc1RgbaUnorm,
    Bc3RgbaUnorm,
    Bc5RgUnorm,
    Bc7Unorm,
}

impl Format {
    /// Size in bytes of one texel, or of one 4x4 block for compressed formats.
    pub const fn block_size(self) -> u32 {
        match self {
            Self::Undefined => 0,
            Self::R8Unorm | Self::R8Uint => 1,
            Self::Rg8Unorm | Self::R16Uint | Self::R16Float | Self::D16Unorm => 2,
            Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::Bgra8Srgb
            | Self::Rg16Float
            | Self::R32Uint
            | Self::R32Sint
            | Self::R32Float
            | Self::D32Float
            | Self::D24UnormS8Uint => 4,
            Self::Rgba16Float | Self::Rg32Float | Self::D32FloatS8Uint | Self::Bc1RgbaUnorm => 8,
            Self::Rgb32Float => 12,
            Self::Rgba32Float
            | Self::Rgba32Uint
            | Self::Bc3RgbaUnorm
            | Self::Bc5RgUnorm
            | Self::Bc7Unorm => 16,
        }
    }

    /// Texel footprint of one block: 4 for block-compressed formats, 1 otherwise.
    pub const fn block_extent(self) -> u32 {
        if self.is_compressed() {
            4
        } else {
            1
        }
    }

    pub const fn is_compressed(self) -> bool {
        matches!(
            self,
            Self::Bc1RgbaUnorm | Self::Bc3RgbaUnorm | Self::Bc5RgUnorm | Self::Bc7Unorm
        )
    }

    pub const fn is_depth(self) -> bool {
        matches!(
            self,
            Self::D16Unorm | Self::D32Float | Self::D24UnormS8Uint | Self::D32FloatS8Uint
        )
    }

    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::D24UnormS8Uint | Self::D32FloatS8Uint)
    }

    pub const fn is_srgb(self) -> bool {
        matches!(self, Self::Rgba8Srgb | Self::Bgra8Srgb)
    }

    /// Row and slice pitch of a tightly packed `width` x `height` region.
    pub const fn surface_pitch(self, width: u32, height: u32) -> (u64, u64) {
        let extent = self.block_extent();
        let blocks_wide = width.div_ceil(extent) as u64;
        let blocks_high = height.div_ceil(extent) as u64;
        let row_pitch = blocks_wide * self.block_size() as u64;
        (row_pitch, row_pitch * blocks_high)
    }

    /// Number of rows in the copy layout of a region `height` texels tall.
    pub const fn row_count(self, height: u32) -> u32 {
        height.div_ceil(self.block_extent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_pitch() {
        assert_eq!(Format::Rgba8Unorm.surface_pitch(16, 8), (64, 512));
        assert_eq!(Format::Rgb32Float.surface_pitch(3, 1), (36, 36));
    }

    #[test]
    fn compressed_pitch_rounds_to_blocks() {
        assert_eq!(Format::Bc1RgbaUnorm.surface_pitch(10, 10), (24, 72));
        assert_eq!(Format::Bc7Unorm.row_count(10), 3);
        assert_eq!(Format::Rgba8Unorm.row_count(10), 10);
    }

    #[test]
    fn depth_classification() {
        assert!(Format::D32Float.is_depth());
        assert!(!Format::D32Float.has_stencil());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(!Format::Bgra8Srgb.is_depth());
        assert!(Format::Bgra8Srgb.is_srgb());
    }
}
