//! Linear texture layouts and texel encoding.

use prism_core::format::Format;
use prism_core::resource::{TextureDesc, TextureType};

/// Placement of one mip level of one array layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceFootprint {
    pub offset: u64,
    pub row_pitch: u64,
    pub slice_pitch: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Tightly packed layout of every subresource, layer-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureLayout {
    format: Format,
    level_count: u32,
    subresources: Vec<SubresourceFootprint>,
    size: u64,
}

impl TextureLayout {
    pub fn new(desc: &TextureDesc) -> Self {
        let (layers, depth) = match desc.texture_type {
            TextureType::Texture3D => (1, u32::from(desc.depth_or_array_layers)),
            TextureType::Texture1D | TextureType::Texture2D => (u32::from(desc.depth_or_array_layers), 1),
        };
        let level_count = u32::from(desc.mip_levels.max(1));
        let mut subresources = Vec::new();
        let mut size = 0;
        for _layer in 0..layers {
            for mip in 0..level_count {
                let width = (desc.width >> mip).max(1);
                let height = (desc.height >> mip).max(1);
                let depth = (depth >> mip).max(1);
                let (row_pitch, slice_pitch) = desc.format.surface_pitch(width, height);
                subresources.push(SubresourceFootprint {
                    offset: size,
                    row_pitch,
                    slice_pitch,
                    width,
                    height,
                    depth,
                });
                size += slice_pitch * u64::from(depth);
            }
        }
        Self {
            format: desc.format,
            level_count,
            subresources,
            size,
        }
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn format(&self) -> Format {
        self.format
    }

    pub fn footprint(&self, mip_level: u32, array_layer: u32) -> SubresourceFootprint {
        let index = (array_layer * self.level_count + mip_level) as usize;
        match self.subresources.get(index) {
            Some(footprint) => *footprint,
            None => prism_core::contract_violation!(
                "subresource (mip {mip_level}, layer {array_layer}) does not exist"
            ),
        }
    }

    /// Byte offset of the block containing texel `(x, y, z)`.
    pub fn texel_offset(&self, footprint: &SubresourceFootprint, x: u32, y: u32, z: u32) -> u64 {
        let extent = self.format.block_extent();
        footprint.offset
            + u64::from(z) * footprint.slice_pitch
            + u64::from(y / extent) * footprint.row_pitch
            + u64::from(x / extent) * u64::from(self.format.block_size())
    }
}

/// Encode one texel of `color` in `format`.
pub fn encode_color(format: Format, color: [f32; 4]) -> Vec<u8> {
    let unorm8 = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;
    let srgb8 = |value: f32| unorm8(linear_to_srgb(value));
    let floats = |count: usize| -> Vec<u8> {
        color[..count]
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect()
    };
    let halves = |count: usize| -> Vec<u8> {
        color[..count]
            .iter()
            .flat_map(|value| f32_to_f16_bits(*value).to_le_bytes())
            .collect()
    };
    match format {
        Format::R8Unorm => vec![unorm8(color[0])],
        Format::Rg8Unorm => vec![unorm8(color[0]), unorm8(color[1])],
        Format::Rgba8Unorm => color.iter().map(|value| unorm8(*value)).collect(),
        Format::Rgba8Srgb => vec![srgb8(color[0]), srgb8(color[1]), srgb8(color[2]), unorm8(color[3])],
        Format::Bgra8Unorm => vec![unorm8(color[2]), unorm8(color[1]), unorm8(color[0]), unorm8(color[3])],
        Format::Bgra8Srgb => vec![srgb8(color[2]), srgb8(color[1]), srgb8(color[0]), unorm8(color[3])],
        Format::R8Uint => vec![color[0] as u8],
        Format::R16Uint => (color[0] as u16).to_le_bytes().to_vec(),
        Format::R32Uint => (color[0] as u32).to_le_bytes().to_vec(),
        Format::R32Sint => (color[0] as i32).to_le_bytes().to_vec(),
        Format::Rgba32Uint => color.iter().flat_map(|value| (*value as u32).to_le_bytes()).collect(),
        Format::R16Float => halves(1),
        Format::Rg16Float => halves(2),
        Format::Rgba16Float => halves(4),
        Format::R32Float => floats(1),
        Format::Rg32Float => floats(2),
        Format::Rgb32Float => floats(3),
        Format::Rgba32Float => floats(4),
        Format::D16Unorm | Format::D32Float | Format::D24UnormS8Uint | Format::D32FloatS8Uint => {
            encode_depth_stencil(format, color[0], 0)
        }
        Format::Undefined
        | Format::Bc1RgbaUnorm
        | Format::Bc3RgbaUnorm
        | Format::Bc5RgUnorm
        | Format::Bc7Unorm => prism_core::contract_violation!("{format:?} cannot be cleared"),
    }
}

/// Encode one depth/stencil texel.
pub fn encode_depth_stencil(format: Format, depth: f32, stencil: u8) -> Vec<u8> {
    let depth = depth.clamp(0.0, 1.0);
    match format {
        Format::D16Unorm => ((depth * f32::from(u16::MAX)).round() as u16).to_le_bytes().to_vec(),
        Format::D32Float => depth.to_le_bytes().to_vec(),
        Format::D24UnormS8Uint => {
            let depth_bits = (f64::from(depth) * f64::from(0x00ff_ffff_u32)).round() as u32;
            (depth_bits | (u32::from(stencil) << 24)).to_le_bytes().to_vec()
        }
        Format::D32FloatS8Uint => {
            let mut bytes = depth.to_le_bytes().to_vec();
            bytes.extend_from_slice(&[stencil, 0, 0, 0]);
            bytes
        }
        other => prism_core::contract_violation!("{other:?} is not a depth format"),
    }
}

fn linear_to_srgb(value: f32) -> f32 {
    let value = value.clamp(0.0, 1.0);
    if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}

/// Round-to-nearest-even conversion to IEEE 754 binary16.
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exponent == 0xff {
        let nan = if mantissa == 0 { 0 } else { 0x0200 };
        return sign | 0x7c00 | nan;
    }
    let half_exponent = exponent - 127 + 15;
    if half_exponent >= 0x1f {
        return sign | 0x7c00;
    }
    if half_exponent <= 0 {
        if half_exponent < -10 {
            return sign;
        }
        let mantissa = mantissa | 0x0080_0000;
        let shift = (14 - half_exponent) as u32;
        let rounded = round_shift(mantissa, shift);
        return sign | rounded as u16;
    }
    let rounded = round_shift(mantissa, 13);
    // A mantissa carry rolls into the exponent, which is the correct result.
    sign | ((((half_exponent as u32) << 10) + rounded) as u16)
}

fn round_shift(value: u32, shift: u32) -> u32 {
    let halfway = 1 << (shift - 1);
    let remainder = value & ((1 << shift) - 1);
    let mut result = value >> shift;
    if remainder > halfway || (remainder == halfway && result & 1 == 1) {
        result += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::resource::BindFlag;

    #[test]
    fn layout_packs_mips_per_layer() {
        let desc = TextureDesc::new_2d(Format::Rgba8Unorm, 4, 4, BindFlag::SHADER_RESOURCE)
            .with_mip_levels(3)
            .with_array_layers(2);
        let layout = TextureLayout::new(&desc);
        assert_eq!(layout.footprint(0, 0).offset, 0);
        assert_eq!(layout.footprint(1, 0).offset, 64);
        assert_eq!(layout.footprint(2, 0).offset, 80);
        assert_eq!(layout.footprint(0, 1).offset, 84);
        assert_eq!(layout.size(), 168);
        assert_eq!(layout.footprint(1, 1).row_pitch, 8);
    }

    #[test]
    fn clear_color_encodings() {
        assert_eq!(encode_color(Format::Rgba8Unorm, [0.0, 0.2, 0.4, 1.0]), vec![0, 51, 102, 255]);
        assert_eq!(encode_color(Format::Bgra8Unorm, [0.0, 0.2, 0.4, 1.0]), vec![102, 51, 0, 255]);
        assert_eq!(encode_color(Format::R32Float, [0.5, 0.0, 0.0, 0.0]), 0.5f32.to_le_bytes().to_vec());
        assert_eq!(encode_depth_stencil(Format::D16Unorm, 1.0, 0), vec![0xff, 0xff]);
    }

    #[test]
    fn half_precision_conversion() {
        assert_eq!(f32_to_f16_bits(0.0), 0x0000);
        assert_eq!(f32_to_f16_bits(1.0), 0x3c00);
        assert_eq!(f32_to_f16_bits(-2.0), 0xc000);
        assert_eq!(f32_to_f16_bits(0.5), 0x3800);
        assert_eq!(f32_to_f16_bits(65504.0), 0x7bff);
        assert_eq!(f32_to_f16_bits(1.0e6), 0x7c00);
        assert_eq!(f32_to_f16_bits(f32::NAN) & 0x7e00, 0x7e00);
        assert_eq!(f32_to_f16_bits(6.0e-8), 0x0001);
    }
}
