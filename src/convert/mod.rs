//! Pixel-layout conversion from captured bitmaps into the tightly packed
//! buffers encoders and clipboards expect.

mod parallel;
mod scalar;

use rayon::prelude::*;

use crate::bitmap::{BitmapData, PixelFormat};
use crate::error::{CaptureError, CaptureResult};

use parallel::{install_conversion_pool, rows_per_chunk, should_parallelize};

const PARALLEL_MIN_PIXELS: usize = 524_288;
const PARALLEL_MIN_CHUNK_PIXELS: usize = 65_536;
const PARALLEL_MAX_WORKERS: usize = 8;

/// Pre-initialize the conversion thread pool so the first capture doesn't
/// pay the cost.
pub fn warmup() {
    parallel::warmup_pool(PARALLEL_MAX_WORKERS);
}

#[derive(Clone, Copy)]
enum Target {
    Rgba,
    Rgb,
    Bgra,
}

impl Target {
    const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba | Self::Bgra => 4,
            Self::Rgb => 3,
        }
    }
}

/// Tightly packed RGBA8 copy of `bitmap`.
pub(crate) fn to_packed_rgba(bitmap: &BitmapData) -> CaptureResult<Vec<u8>> {
    convert(bitmap, bitmap.width(), bitmap.height(), Target::Rgba)
}

/// Tightly packed RGB8 copy of `bitmap`, alpha dropped.
pub(crate) fn to_packed_rgb(bitmap: &BitmapData) -> CaptureResult<Vec<u8>> {
    convert(bitmap, bitmap.width(), bitmap.height(), Target::Rgb)
}

/// Tightly packed BGRA8 copy of the top-left `width` x `height` pixels.
pub(crate) fn to_packed_bgra_cropped(
    bitmap: &BitmapData,
    width: u32,
    height: u32,
) -> CaptureResult<Vec<u8>> {
    if width > bitmap.width() || height > bitmap.height() {
        return Err(CaptureError::BufferOverflow);
    }
    convert(bitmap, width, height, Target::Bgra)
}

fn convert(bitmap: &BitmapData, width: u32, height: u32, target: Target) -> CaptureResult<Vec<u8>> {
    let width = usize::try_from(width).map_err(|_| CaptureError::BufferOverflow)?;
    let height = usize::try_from(height).map_err(|_| CaptureError::BufferOverflow)?;
    let src_stride = bitmap.stride();
    let src_row_bytes = width
        .checked_mul(bitmap.format().bytes_per_pixel())
        .ok_or(CaptureError::BufferOverflow)?;
    let dst_row_bytes = width
        .checked_mul(target.bytes_per_pixel())
        .ok_or(CaptureError::BufferOverflow)?;
    let dst_len = dst_row_bytes
        .checked_mul(height)
        .ok_or(CaptureError::BufferOverflow)?;

    let mut dst = vec![0u8; dst_len];
    if dst_len == 0 {
        return Ok(dst);
    }

    let src = bitmap.as_bytes();
    let required = src_stride
        .checked_mul(height.saturating_sub(1))
        .and_then(|base| base.checked_add(src_row_bytes))
        .ok_or(CaptureError::BufferOverflow)?;
    if src.len() < required {
        return Err(CaptureError::BufferOverflow);
    }

    let format = bitmap.format();
    let row_job = move |y: usize, dst_row: &mut [u8]| {
        let start = y * src_stride;
        let src_row = &src[start..start + src_row_bytes];
        convert_row(format, target, src_row, dst_row);
    };

    let pixel_count = width.saturating_mul(height);
    if should_parallelize(
        pixel_count,
        PARALLEL_MIN_PIXELS,
        PARALLEL_MIN_CHUNK_PIXELS,
        PARALLEL_MAX_WORKERS,
    ) {
        let rows = rows_per_chunk(width, height, PARALLEL_MIN_CHUNK_PIXELS, PARALLEL_MAX_WORKERS);
        install_conversion_pool(PARALLEL_MAX_WORKERS, || {
            dst.par_chunks_mut(dst_row_bytes * rows)
                .enumerate()
                .for_each(|(chunk, block)| {
                    for (offset, dst_row) in block.chunks_exact_mut(dst_row_bytes).enumerate() {
                        row_job(chunk * rows + offset, dst_row);
                    }
                });
        });
    } else {
        for (y, dst_row) in dst.chunks_exact_mut(dst_row_bytes).enumerate() {
            row_job(y, dst_row);
        }
    }

    Ok(dst)
}

fn convert_row(format: PixelFormat, target: Target, src: &[u8], dst: &mut [u8]) {
    match (format, target) {
        (PixelFormat::Bgra8, Target::Rgba) | (PixelFormat::Rgba8, Target::Bgra) => {
            scalar::bgra_row_to_rgba(src, dst)
        }
        (PixelFormat::Bgra8, Target::Bgra) | (PixelFormat::Rgba8, Target::Rgba) => {
            dst.copy_from_slice(src)
        }
        (PixelFormat::Bgra8, Target::Rgb) => scalar::bgra_row_to_rgb(src, dst),
        (PixelFormat::Rgba8, Target::Rgb) => scalar::rgba_row_to_rgb(src, dst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::LockToken;

    fn solid(width: u32, height: u32, stride: usize, bgra: [u8; 4]) -> CaptureResult<BitmapData> {
        let mut pixels = vec![0u8; stride * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let at = y * stride + x * 4;
                pixels[at..at + 4].copy_from_slice(&bgra);
            }
        }
        BitmapData::new(width, height, PixelFormat::Bgra8, stride, pixels, LockToken::new(9))
    }

    #[test]
    fn rgb_conversion_drops_alpha() -> CaptureResult<()> {
        let bitmap = solid(3, 2, 16, [10, 20, 30, 40])?;
        let rgb = to_packed_rgb(&bitmap)?;
        assert_eq!(rgb.len(), 18);
        assert!(rgb.chunks_exact(3).all(|px| px == [30, 20, 10]));
        Ok(())
    }

    #[test]
    fn cropping_keeps_top_left_pixels() -> CaptureResult<()> {
        let bitmap = solid(5, 3, 24, [1, 2, 3, 4])?;
        let bgra = to_packed_bgra_cropped(&bitmap, 4, 2)?;
        assert_eq!(bgra.len(), 4 * 2 * 4);
        assert!(bgra.chunks_exact(4).all(|px| px == [1, 2, 3, 4]));
        assert!(to_packed_bgra_cropped(&bitmap, 6, 2).is_err());
        Ok(())
    }

    #[test]
    fn large_frames_convert_in_parallel_identically() -> CaptureResult<()> {
        let bitmap = solid(1024, 600, 1024 * 4, [7, 8, 9, 255])?;
        let rgba = to_packed_rgba(&bitmap)?;
        assert_eq!(rgba.len(), 1024 * 600 * 4);
        assert!(rgba.chunks_exact(4).all(|px| px == [9, 8, 7, 255]));
        Ok(())
    }
}
