//! Bounds-checked CPU copies into mapped staging memory.

use crate::error::{Result, RhiError};

/// Pitch layout of a texture upload into a staging buffer.
///
/// Source and destination pitches are independent: the destination usually
/// has rows padded to the device's texture data pitch alignment, while the
/// source is whatever the image decoder produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureUploadLayout {
    pub buffer_offset: u64,
    pub buffer_row_pitch: u64,
    pub buffer_slice_pitch: u64,
    pub src_row_pitch: u64,
    pub src_slice_pitch: u64,
    /// Bytes copied from each row.
    pub row_size: u64,
    pub num_rows: u32,
    pub num_slices: u32,
}

impl TextureUploadLayout {
    /// Bytes of `dst` touched by the copy, starting at `buffer_offset`.
    fn dst_extent(&self) -> Option<u64> {
        self.extent(self.buffer_row_pitch, self.buffer_slice_pitch)
    }

    fn src_extent(&self) -> Option<u64> {
        self.extent(self.src_row_pitch, self.src_slice_pitch)
    }

    fn extent(&self, row_pitch: u64, slice_pitch: u64) -> Option<u64> {
        if self.num_rows == 0 || self.num_slices == 0 {
            return Some(0);
        }
        let last_slice = slice_pitch.checked_mul(u64::from(self.num_slices - 1))?;
        let last_row = row_pitch.checked_mul(u64::from(self.num_rows - 1))?;
        last_slice.checked_add(last_row)?.checked_add(self.row_size)
    }
}

/// Copy `data` into `dst` at `offset`.
pub fn write_bytes(dst: &mut [u8], offset: u64, data: &[u8]) -> Result<()> {
    let range = checked_range(offset, data.len() as u64, dst.len())?;
    dst[range].copy_from_slice(data);
    Ok(())
}

/// Copy `dst.len()` bytes out of `src` starting at `offset`.
pub fn read_bytes(src: &[u8], offset: u64, dst: &mut [u8]) -> Result<()> {
    let range = checked_range(offset, dst.len() as u64, src.len())?;
    dst.copy_from_slice(&src[range]);
    Ok(())
}

/// Copy rows of texel data from `src` into `dst` following `layout`.
///
/// For every slice `z` and row `y`, `row_size` bytes are read at
/// `src_slice_pitch * z + src_row_pitch * y` and written at
/// `buffer_offset + buffer_slice_pitch * z + buffer_row_pitch * y`.
pub fn copy_texture_rows(dst: &mut [u8], src: &[u8], layout: &TextureUploadLayout) -> Result<()> {
    let dst_extent = layout
        .dst_extent()
        .ok_or_else(|| RhiError::InvalidState("Upload layout overflows".to_string()))?;
    checked_range(layout.buffer_offset, dst_extent, dst.len())?;
    let src_extent = layout
        .src_extent()
        .ok_or_else(|| RhiError::InvalidState("Source layout overflows".to_string()))?;
    if src_extent > src.len() as u64 {
        return Err(RhiError::InvalidState(format!(
            "Source data holds {} bytes, layout reads {src_extent}",
            src.len()
        )));
    }

    let row_size = layout.row_size as usize;
    for z in 0..u64::from(layout.num_slices) {
        let dst_slice = layout.buffer_offset + layout.buffer_slice_pitch * z;
        let src_slice = layout.src_slice_pitch * z;
        for y in 0..u64::from(layout.num_rows) {
            let dst_start = (dst_slice + layout.buffer_row_pitch * y) as usize;
            let src_start = (src_slice + layout.src_row_pitch * y) as usize;
            dst[dst_start..dst_start + row_size]
                .copy_from_slice(&src[src_start..src_start + row_size]);
        }
    }
    Ok(())
}

fn checked_range(offset: u64, len: u64, capacity: usize) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| RhiError::InvalidState("Offset overflow".to_string()))?;
    if end > capacity as u64 {
        return Err(RhiError::InvalidState(format!(
            "Range {offset}..{end} exceeds mapped size {capacity}"
        )));
    }
    Ok(offset as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_bytes() {
        let mut buffer = vec![0u8; 8];
        write_bytes(&mut buffer, 2, &[1, 2, 3]).unwrap();
        assert_eq!(buffer, [0, 0, 1, 2, 3, 0, 0, 0]);

        let mut out = [0u8; 2];
        read_bytes(&buffer, 3, &mut out).unwrap();
        assert_eq!(out, [2, 3]);
    }

    #[test]
    fn write_past_end_is_rejected() {
        let mut buffer = vec![0u8; 4];
        assert!(write_bytes(&mut buffer, 2, &[1, 2, 3]).is_err());
        assert!(write_bytes(&mut buffer, u64::MAX, &[1]).is_err());
        assert_eq!(buffer, [0; 4]);
    }

    #[test]
    fn texture_rows_respect_both_pitches() {
        // Two 2x2 slices of 1-byte texels, source rows tightly packed,
        // destination rows padded to 4 bytes and slices to 8.
        let src: Vec<u8> = (1..=8).collect();
        let mut dst = vec![0u8; 20];
        let layout = TextureUploadLayout {
            buffer_offset: 4,
            buffer_row_pitch: 4,
            buffer_slice_pitch: 8,
            src_row_pitch: 2,
            src_slice_pitch: 4,
            row_size: 2,
            num_rows: 2,
            num_slices: 2,
        };
        copy_texture_rows(&mut dst, &src, &layout).unwrap();
        assert_eq!(
            dst,
            [0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0, 5, 6, 0, 0, 7, 8, 0, 0]
        );
    }

    #[test]
    fn texture_rows_out_of_bounds_leave_destination_untouched() {
        let src = vec![9u8; 16];
        let mut dst = vec![0u8; 8];
        let layout = TextureUploadLayout {
            buffer_row_pitch: 4,
            buffer_slice_pitch: 16,
            src_row_pitch: 4,
            src_slice_pitch: 8,
            row_size: 4,
            num_rows: 2,
            num_slices: 2,
            ..Default::default()
        };
        assert!(copy_texture_rows(&mut dst, &src, &layout).is_err());
        assert_eq!(dst, [0; 8]);
    }
}
