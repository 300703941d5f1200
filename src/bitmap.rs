use std::sync::Arc;

use crate::convert;
use crate::error::{CaptureError, CaptureResult};

/// Pixel layout of a [`BitmapData`]. Both variants are 32 bits per pixel;
/// desktop backends produce `Bgra8`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    #[default]
    Bgra8,
    Rgba8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra8 | Self::Rgba8 => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bgra8 => "bgra8",
            Self::Rgba8 => "rgba8",
        }
    }
}

/// Opaque handle identifying one outstanding bitmap lock on a frame
/// source. Returned inside [`BitmapData`] and checked on unlock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(u64);

impl LockToken {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// A readable view of one captured frame.
///
/// The pixel memory is shared and read-only, so a bitmap can be handed to
/// several consumers (codec, bitmap sinks, thumbnail) without copying.
/// The lock token is only meaningful to the frame source that produced
/// the bitmap, between `lock_frame_bitmap` and `unlock_frame_bitmap`.
#[derive(Clone)]
pub struct BitmapData {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    pixels: Arc<[u8]>,
    token: LockToken,
}

impl BitmapData {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
        pixels: impl Into<Arc<[u8]>>,
        token: LockToken,
    ) -> CaptureResult<Self> {
        let pixels = pixels.into();
        let row_bytes = row_len(width, format)?;
        if stride < row_bytes {
            return Err(CaptureError::InvalidConfig(format!(
                "stride {stride} is smaller than one row of {width} {} pixels",
                format.as_str()
            )));
        }
        let required = buffer_len(stride, height)?;
        if pixels.len() < required {
            return Err(CaptureError::BufferOverflow);
        }
        Ok(Self {
            width,
            height,
            format,
            stride,
            pixels,
            token,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// The visible bytes of row `y`, without stride padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = (y as usize).checked_mul(self.stride)?;
        let len = (self.width as usize).checked_mul(self.format.bytes_per_pixel())?;
        self.pixels.get(start..start.checked_add(len)?)
    }

    /// Raw pixel bytes at `(x, y)` in the bitmap's own channel order.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width {
            return None;
        }
        let row = self.row(y)?;
        let offset = x as usize * 4;
        let px = row.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Tightly packed RGBA copy of the bitmap.
    pub fn to_rgba(&self) -> CaptureResult<Vec<u8>> {
        convert::to_packed_rgba(self)
    }

    #[cfg(test)]
    pub(crate) fn shares_memory_with(&self, other: &BitmapData) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl std::fmt::Debug for BitmapData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapData")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("stride", &self.stride)
            .field("data_len", &self.pixels.len())
            .field("token", &self.token)
            .finish()
    }
}

/// Writable composite buffer a frame source stitches into before handing
/// it out as a [`BitmapData`].
pub(crate) struct FrameBuffer {
    width: u32,
    height: u32,
    stride: usize,
    data: Vec<u8>,
}

impl FrameBuffer {
    pub(crate) fn zeroed(width: u32, height: u32) -> CaptureResult<Self> {
        let stride = row_len(width, PixelFormat::Bgra8)?;
        let len = buffer_len(stride, height)?;
        Ok(Self {
            width,
            height,
            stride,
            data: vec![0; len],
        })
    }

    pub(crate) fn width(&self) -> u32 {
        self.width
    }

    pub(crate) fn height(&self) -> u32 {
        self.height
    }

    pub(crate) fn stride(&self) -> usize {
        self.stride
    }

    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn into_bitmap(self, token: LockToken) -> CaptureResult<BitmapData> {
        BitmapData::new(
            self.width,
            self.height,
            PixelFormat::Bgra8,
            self.stride,
            self.data,
            token,
        )
    }
}

/// Small RGBA preview of a capture for presentation next to sink results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Thumbnail {
    pub const DEFAULT_MAX_SIDE: u32 = 256;

    /// Downscale `bitmap` so that its longer side is at most `max_side`,
    /// keeping the aspect ratio.
    pub fn from_bitmap(bitmap: &BitmapData, max_side: u32) -> CaptureResult<Self> {
        let rgba = bitmap.to_rgba()?;
        let image = image::RgbaImage::from_raw(bitmap.width(), bitmap.height(), rgba)
            .ok_or(CaptureError::BufferOverflow)?;

        let max_side = max_side.max(1);
        let longer = bitmap.width().max(bitmap.height());
        let (width, height) = if longer <= max_side {
            (bitmap.width(), bitmap.height())
        } else {
            let scale = f64::from(max_side) / f64::from(longer);
            (
                ((f64::from(bitmap.width()) * scale).round() as u32).max(1),
                ((f64::from(bitmap.height()) * scale).round() as u32).max(1),
            )
        };

        let scaled = image::imageops::thumbnail(&image, width, height);
        Ok(Self {
            width,
            height,
            rgba: scaled.into_raw(),
        })
    }
}

fn row_len(width: u32, format: PixelFormat) -> CaptureResult<usize> {
    usize::try_from(width)
        .map_err(|_| CaptureError::BufferOverflow)?
        .checked_mul(format.bytes_per_pixel())
        .ok_or(CaptureError::BufferOverflow)
}

fn buffer_len(stride: usize, height: u32) -> CaptureResult<usize> {
    let h = usize::try_from(height).map_err(|_| CaptureError::BufferOverflow)?;
    stride.checked_mul(h).ok_or(CaptureError::BufferOverflow)
}
