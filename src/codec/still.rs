use std::io::{Cursor, Write};

use image::codecs::bmp::BmpEncoder;
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::tiff::TiffEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError};
use serde::{Deserialize, Serialize};

use super::StillImageCodec;
use crate::bitmap::BitmapData;
use crate::convert;
use crate::error::{CaptureError, CaptureResult};

fn encoding_error(codec: &str, err: ImageError) -> CaptureError {
    CaptureError::Encoding(format!("{codec}: {err}"))
}

fn flush_into(output: &mut dyn Write, bytes: &[u8]) -> CaptureResult<()> {
    output.write_all(bytes)?;
    output.flush()?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PngCompression {
    #[default]
    Default,
    Fast,
    Best,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PngFilter {
    None,
    Sub,
    Up,
    Avg,
    Paeth,
    #[default]
    Adaptive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PngOptions {
    pub compression: PngCompression,
    pub filter: PngFilter,
}

/// Lossless PNG with an alpha channel.
#[derive(Clone, Debug, Default)]
pub struct PngCodec {
    options: PngOptions,
}

impl PngCodec {
    pub fn new(options: PngOptions) -> Self {
        Self { options }
    }

    fn compression(&self) -> CompressionType {
        match self.options.compression {
            PngCompression::Default => CompressionType::Default,
            PngCompression::Fast => CompressionType::Fast,
            PngCompression::Best => CompressionType::Best,
        }
    }

    fn filter(&self) -> FilterType {
        match self.options.filter {
            PngFilter::None => FilterType::NoFilter,
            PngFilter::Sub => FilterType::Sub,
            PngFilter::Up => FilterType::Up,
            PngFilter::Avg => FilterType::Avg,
            PngFilter::Paeth => FilterType::Paeth,
            PngFilter::Adaptive => FilterType::Adaptive,
        }
    }
}

impl StillImageCodec for PngCodec {
    fn media_type(&self) -> &'static str {
        "image/png"
    }

    fn file_extension(&self) -> &'static str {
        "png"
    }

    fn encode(&self, bitmap: &BitmapData, output: &mut dyn Write) -> CaptureResult<()> {
        let rgba = convert::to_packed_rgba(bitmap)?;
        let mut bytes = Vec::new();
        PngEncoder::new_with_quality(&mut bytes, self.compression(), self.filter())
            .write_image(&rgba, bitmap.width(), bitmap.height(), ExtendedColorType::Rgba8)
            .map_err(|err| encoding_error("png", err))?;
        flush_into(output, &bytes)
    }
}

const DEFAULT_JPEG_QUALITY: u8 = 90;

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JpegOptions {
    /// 1 (smallest) to 100 (best).
    #[serde(default = "default_jpeg_quality")]
    pub quality: u8,
}

impl Default for JpegOptions {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Baseline JPEG. Alpha is dropped.
#[derive(Clone, Debug)]
pub struct JpegCodec {
    quality: u8,
}

impl JpegCodec {
    pub fn new(options: JpegOptions) -> CaptureResult<Self> {
        if !(1..=100).contains(&options.quality) {
            return Err(CaptureError::InvalidConfig(format!(
                "jpeg quality {} is outside 1..=100",
                options.quality
            )));
        }
        Ok(Self {
            quality: options.quality,
        })
    }
}

impl StillImageCodec for JpegCodec {
    fn media_type(&self) -> &'static str {
        "image/jpeg"
    }

    fn file_extension(&self) -> &'static str {
        "jpg"
    }

    fn encode(&self, bitmap: &BitmapData, output: &mut dyn Write) -> CaptureResult<()> {
        let rgb = convert::to_packed_rgb(bitmap)?;
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.quality)
            .write_image(&rgb, bitmap.width(), bitmap.height(), ExtendedColorType::Rgb8)
            .map_err(|err| encoding_error("jpeg", err))?;
        flush_into(output, &bytes)
    }
}

/// 32-bit BMP.
#[derive(Clone, Copy, Debug, Default)]
pub struct BmpCodec;

impl StillImageCodec for BmpCodec {
    fn media_type(&self) -> &'static str {
        "image/bmp"
    }

    fn file_extension(&self) -> &'static str {
        "bmp"
    }

    fn encode(&self, bitmap: &BitmapData, output: &mut dyn Write) -> CaptureResult<()> {
        let rgba = convert::to_packed_rgba(bitmap)?;
        let mut bytes = Vec::new();
        BmpEncoder::new(&mut bytes)
            .write_image(&rgba, bitmap.width(), bitmap.height(), ExtendedColorType::Rgba8)
            .map_err(|err| encoding_error("bmp", err))?;
        flush_into(output, &bytes)
    }
}

/// Uncompressed RGBA TIFF. The encoder needs to seek, so it writes into
/// memory first.
#[derive(Clone, Copy, Debug, Default)]
pub struct TiffCodec;

impl StillImageCodec for TiffCodec {
    fn media_type(&self) -> &'static str {
        "image/tiff"
    }

    fn file_extension(&self) -> &'static str {
        "tiff"
    }

    fn encode(&self, bitmap: &BitmapData, output: &mut dyn Write) -> CaptureResult<()> {
        let rgba = convert::to_packed_rgba(bitmap)?;
        let mut bytes = Vec::new();
        TiffEncoder::new(Cursor::new(&mut bytes))
            .write_image(&rgba, bitmap.width(), bitmap.height(), ExtendedColorType::Rgba8)
            .map_err(|err| encoding_error("tiff", err))?;
        flush_into(output, &bytes)
    }
}

/// Single-frame GIF, quantized to a 256-color palette.
#[derive(Clone, Copy, Debug, Default)]
pub struct GifCodec;

impl StillImageCodec for GifCodec {
    fn media_type(&self) -> &'static str {
        "image/gif"
    }

    fn file_extension(&self) -> &'static str {
        "gif"
    }

    fn encode(&self, bitmap: &BitmapData, output: &mut dyn Write) -> CaptureResult<()> {
        let rgba = convert::to_packed_rgba(bitmap)?;
        let mut bytes = Vec::new();
        {
            // The trailer is written when the encoder is dropped.
            let mut encoder = GifEncoder::new(&mut bytes);
            encoder
                .encode(&rgba, bitmap.width(), bitmap.height(), ExtendedColorType::Rgba8)
                .map_err(|err| encoding_error("gif", err))?;
        }
        flush_into(output, &bytes)
    }
}
