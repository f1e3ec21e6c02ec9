//! Translation between prism formats and `vk::Format`.

use ash::vk;
use prism_core::format::Format;

pub const fn to_vk_format(format: Format) -> vk::Format {
    match format {
        Format::Undefined => vk::Format::UNDEFINED,
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::R8Uint => vk::Format::R8_UINT,
        Format::R16Uint => vk::Format::R16_UINT,
        Format::R16Float => vk::Format::R16_SFLOAT,
        Format::Rg16Float => vk::Format::R16G16_SFLOAT,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Sint => vk::Format::R32_SINT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rg32Float => vk::Format::R32G32_SFLOAT,
        Format::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        Format::Bc1RgbaUnorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Format::Bc3RgbaUnorm => vk::Format::BC3_UNORM_BLOCK,
        Format::Bc5RgUnorm => vk::Format::BC5_UNORM_BLOCK,
        Format::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
    }
}

/// Format of a swapchain surface; `None` for formats prism has no name for.
pub fn from_vk_format(format: vk::Format) -> Option<Format> {
    Some(match format {
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => Format::Bgra8Srgb,
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
        vk::Format::R16G16B16A16_SFLOAT => Format::Rgba16Float,
        _ => return None,
    })
}

/// Aspects an image view or copy of `format` touches.
pub fn aspect_flags(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn index_type(format: Format) -> vk::IndexType {
    match format {
        Format::R16Uint => vk::IndexType::UINT16,
        Format::R32Uint => vk::IndexType::UINT32,
        _ => prism_core::contract_violation!("index buffers must be R16Uint or R32Uint"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_formats_map_back() {
        for format in [Format::Bgra8Unorm, Format::Bgra8Srgb, Format::Rgba8Unorm] {
            assert_eq!(from_vk_format(to_vk_format(format)), Some(format));
        }
        assert_eq!(from_vk_format(vk::Format::A2B10G10R10_UNORM_PACK32), None);
    }

    #[test]
    fn depth_stencil_aspects() {
        assert_eq!(aspect_flags(Format::D32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_flags(Format::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_flags(Format::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn index_formats() {
        assert_eq!(index_type(Format::R16Uint), vk::IndexType::UINT16);
        assert_eq!(index_type(Format::R32Uint), vk::IndexType::UINT32);
    }
}
