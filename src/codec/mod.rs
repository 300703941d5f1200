//! Encoders that turn captured bitmaps into compressed bytes.
//!
//! Still codecs encode one bitmap in a single call. Video codecs open a
//! session bound to one frame size, take frames with strictly increasing
//! timestamps, and are finalized exactly once. Codecs are looked up by a
//! logical id plus a JSON options bag through [`CodecRegistry`].

mod ffmpeg;
mod gif;
mod still;

use std::io::Write;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bitmap::BitmapData;
use crate::error::{CaptureError, CaptureResult};

pub use ffmpeg::{FfmpegCodec, FfmpegOptions, VideoProfile};
pub use gif::{GifVideoCodec, GifVideoOptions};
pub use still::{
    BmpCodec, GifCodec, JpegCodec, JpegOptions, PngCodec, PngCompression, PngFilter, PngOptions,
    TiffCodec,
};

/// Presentation timestamps are expressed in 100 ns ticks.
pub type Ticks = u64;

pub const TICKS_PER_SECOND: Ticks = 10_000_000;

/// What a capture produces: one still image or a continuous video.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    StillImage,
    Video,
}

impl MediaKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StillImage => "still_image",
            Self::Video => "video",
        }
    }
}

/// A complete encoded still image, shared read-only between sinks.
#[derive(Clone, Debug)]
pub struct EncodedImage {
    pub bytes: Arc<[u8]>,
    pub media_type: &'static str,
    pub file_extension: &'static str,
}

pub trait StillImageCodec: Send {
    fn media_type(&self) -> &'static str;

    fn file_extension(&self) -> &'static str;

    /// Encode `bitmap` into `output`. The bitmap is not retained.
    fn encode(&self, bitmap: &BitmapData, output: &mut dyn Write) -> CaptureResult<()>;

    fn encode_to_image(&self, bitmap: &BitmapData) -> CaptureResult<EncodedImage> {
        let mut bytes = Vec::new();
        self.encode(bitmap, &mut bytes)?;
        Ok(EncodedImage {
            bytes: bytes.into(),
            media_type: self.media_type(),
            file_extension: self.file_extension(),
        })
    }
}

pub trait VideoCodec: Send {
    fn media_type(&self) -> &'static str;

    fn file_extension(&self) -> &'static str;

    /// Nominal frames per second the session is configured for.
    fn frame_rate(&self) -> u32;

    /// Replace the codec's options. Only legal before [`initialize`].
    ///
    /// [`initialize`]: VideoCodec::initialize
    fn apply_options(&mut self, options: &serde_json::Value) -> CaptureResult<()>;

    /// Open a session for frames of `width` x `height`.
    fn initialize(&mut self, width: u32, height: u32, output: &mut dyn Write)
    -> CaptureResult<()>;

    fn encode(
        &mut self,
        bitmap: &BitmapData,
        timestamp: Ticks,
        output: &mut dyn Write,
    ) -> CaptureResult<()>;

    /// Flush and close the session. Runs at most once.
    fn finalize(&mut self, output: &mut dyn Write) -> CaptureResult<()>;
}

/// A configured codec of either kind.
pub enum Codec {
    Still(Box<dyn StillImageCodec>),
    Video(Box<dyn VideoCodec>),
}

impl Codec {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Still(_) => MediaKind::StillImage,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Still(codec) => codec.media_type(),
            Self::Video(codec) => codec.media_type(),
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Still(codec) => codec.file_extension(),
            Self::Video(codec) => codec.file_extension(),
        }
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("kind", &self.kind())
            .field("media_type", &self.media_type())
            .finish()
    }
}

pub type CodecFactory = Arc<dyn Fn(&serde_json::Value) -> CaptureResult<Codec> + Send + Sync>;

/// Logical codec id to factory mapping.
#[derive(Clone)]
pub struct CodecRegistry {
    factories: FxHashMap<String, CodecFactory>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// `png`, `jpeg`, `bmp`, `tiff`, `gif`, `gif-video`, `h264` and `h265`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("png", |options| {
            Ok(Codec::Still(Box::new(PngCodec::new(parse_options("png", options)?))))
        });
        registry.register("jpeg", |options| {
            Ok(Codec::Still(Box::new(JpegCodec::new(parse_options("jpeg", options)?)?)))
        });
        registry.register("bmp", |options| {
            reject_options("bmp", options)?;
            Ok(Codec::Still(Box::new(BmpCodec)))
        });
        registry.register("tiff", |options| {
            reject_options("tiff", options)?;
            Ok(Codec::Still(Box::new(TiffCodec)))
        });
        registry.register("gif", |options| {
            reject_options("gif", options)?;
            Ok(Codec::Still(Box::new(GifCodec)))
        });
        registry.register("gif-video", |options| {
            let mut codec = GifVideoCodec::default();
            codec.apply_options(options)?;
            Ok(Codec::Video(Box::new(codec)))
        });
        registry.register("h264", |options| {
            let mut codec = FfmpegCodec::new(VideoProfile::H264);
            codec.apply_options(options)?;
            Ok(Codec::Video(Box::new(codec)))
        });
        registry.register("h265", |options| {
            let mut codec = FfmpegCodec::new(VideoProfile::H265);
            codec.apply_options(options)?;
            Ok(Codec::Video(Box::new(codec)))
        });
        registry
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> CaptureResult<Codec> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn create(&self, id: &str, options: &serde_json::Value) -> CaptureResult<Codec> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| CaptureError::CodecInitialization(format!("unknown codec `{id}`")))?;
        factory(options)
    }
}

/// Deserialize a codec's options bag. `null` selects the defaults.
pub(crate) fn parse_options<T>(codec: &str, options: &serde_json::Value) -> CaptureResult<T>
where
    T: DeserializeOwned + Default,
{
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone())
        .map_err(|err| CaptureError::InvalidConfig(format!("{codec} options: {err}")))
}

fn reject_options(codec: &str, options: &serde_json::Value) -> CaptureResult<()> {
    match options {
        serde_json::Value::Null => Ok(()),
        serde_json::Value::Object(map) if map.is_empty() => Ok(()),
        _ => Err(CaptureError::InvalidConfig(format!(
            "{codec} takes no options"
        ))),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum SessionState {
    #[default]
    Configuring,
    Open,
    Finalized,
}

/// Video session lifecycle shared by the video codecs.
#[derive(Debug, Default)]
pub(crate) struct SessionGate {
    state: SessionState,
    last_timestamp: Option<Ticks>,
}

impl SessionGate {
    pub(crate) fn ensure_configurable(&self, codec: &str) -> CaptureResult<()> {
        match self.state {
            SessionState::Configuring => Ok(()),
            _ => Err(CaptureError::InvalidState(format!(
                "{codec} options cannot change after initialize"
            ))),
        }
    }

    pub(crate) fn open(&mut self, codec: &str) -> CaptureResult<()> {
        self.ensure_configurable(codec)
            .map_err(|_| CaptureError::InvalidState(format!("{codec} session already opened")))?;
        self.state = SessionState::Open;
        Ok(())
    }

    /// Check that a frame may be encoded at `timestamp`.
    pub(crate) fn admit(&mut self, codec: &str, timestamp: Ticks) -> CaptureResult<()> {
        if self.state != SessionState::Open {
            return Err(CaptureError::InvalidState(format!(
                "{codec} session is not open"
            )));
        }
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                return Err(CaptureError::Encoding(format!(
                    "{codec} timestamp {timestamp} does not follow {last}"
                )));
            }
        }
        self.last_timestamp = Some(timestamp);
        Ok(())
    }

    pub(crate) fn close(&mut self, codec: &str) -> CaptureResult<()> {
        if self.state != SessionState::Open {
            return Err(CaptureError::InvalidState(format!(
                "{codec} session is not open"
            )));
        }
        self.state = SessionState::Finalized;
        Ok(())
    }
}
