//! Request-level entry point: region, codec and sinks in, delivered capture
//! out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, DisplayPlatform, default_platform};
use crate::bitmap::Thumbnail;
use crate::codec::{Codec, CodecRegistry, MediaKind};
use crate::error::{CaptureError, CaptureResult};
use crate::fanout::{FanOutReport, StillPayload, fan_out};
use crate::recording::{RecordingConfig, RecordingSession};
use crate::region::{Rectangle, RegionSelector};
use crate::sink::{MultiSinkStream, SinkContext, SinkDelivery, SinkHandle, SinkRegistry};
use crate::source::{FrameSource, SourceConfig, create_frame_source};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub id: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    pub id: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// One capture: where, what kind, which codec, and where the result goes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub region: RegionSelector,
    pub media: MediaKind,
    pub codec: CodecSpec,
    pub sinks: Vec<SinkSpec>,
}

impl CaptureRequest {
    pub fn new(region: RegionSelector, media: MediaKind, codec: impl Into<String>) -> Self {
        Self {
            region,
            media,
            codec: CodecSpec {
                id: codec.into(),
                options: serde_json::Value::Null,
            },
            sinks: Vec::new(),
        }
    }

    pub fn with_codec_options(mut self, options: serde_json::Value) -> Self {
        self.codec.options = options;
        self
    }

    pub fn with_sink(mut self, id: impl Into<String>, options: serde_json::Value) -> Self {
        self.sinks.push(SinkSpec {
            id: id.into(),
            options,
        });
        self
    }

    fn validate(&self, expected: MediaKind) -> CaptureResult<()> {
        if self.media != expected {
            return Err(CaptureError::InvalidConfig(format!(
                "request is for {}, not {}",
                self.media.as_str(),
                expected.as_str()
            )));
        }
        if self.sinks.is_empty() {
            return Err(CaptureError::InvalidConfig(
                "capture request names no sink".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a still capture.
#[derive(Debug)]
pub struct StillCapture {
    pub media_type: &'static str,
    pub file_extension: &'static str,
    pub bounds: Rectangle,
    pub backend: BackendKind,
    pub thumbnail: Option<Thumbnail>,
    pub report: FanOutReport,
}

pub struct CapturerBuilder {
    platform: Option<Arc<dyn DisplayPlatform>>,
    codecs: CodecRegistry,
    sinks: SinkRegistry,
    source_config: SourceConfig,
    recording_config: RecordingConfig,
}

impl Default for CapturerBuilder {
    fn default() -> Self {
        Self {
            platform: None,
            codecs: CodecRegistry::with_builtin(),
            sinks: SinkRegistry::with_builtin(),
            source_config: SourceConfig::default(),
            recording_config: RecordingConfig::default(),
        }
    }
}

impl CapturerBuilder {
    /// Defaults to the native platform.
    pub fn platform(mut self, platform: Arc<dyn DisplayPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn sinks(mut self, sinks: SinkRegistry) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn source_config(mut self, config: SourceConfig) -> Self {
        self.source_config = config;
        self
    }

    pub fn recording_config(mut self, config: RecordingConfig) -> Self {
        self.recording_config = config;
        self
    }

    pub fn build(self) -> CaptureResult<Capturer> {
        let platform = match self.platform {
            Some(platform) => platform,
            None => default_platform()?,
        };
        crate::convert::warmup();
        Ok(Capturer {
            platform,
            codecs: self.codecs,
            sinks: self.sinks,
            source_config: self.source_config,
            recording_config: self.recording_config,
        })
    }
}

/// Runs capture requests against one display platform.
pub struct Capturer {
    platform: Arc<dyn DisplayPlatform>,
    codecs: CodecRegistry,
    sinks: SinkRegistry,
    source_config: SourceConfig,
    recording_config: RecordingConfig,
}

impl Capturer {
    pub fn builder() -> CapturerBuilder {
        CapturerBuilder::default()
    }

    pub fn platform(&self) -> &Arc<dyn DisplayPlatform> {
        &self.platform
    }

    fn open_source(&self, region: &RegionSelector) -> CaptureResult<Box<dyn FrameSource>> {
        let rect = region.resolve(&self.platform.layout()?)?;
        create_frame_source(&self.platform, rect, &self.source_config)
    }

    fn resolve_sinks(&self, request: &CaptureRequest, context: &SinkContext) -> Vec<SinkHandle> {
        request
            .sinks
            .iter()
            .map(|spec| self.sinks.resolve(&spec.id, &spec.options, context))
            .collect()
    }

    /// Capture one frame, encode it and deliver it to every sink.
    ///
    /// Sink failures are reported in [`StillCapture::report`]; only
    /// failures before delivery starts are returned as errors.
    pub fn capture_still(&self, request: &CaptureRequest) -> CaptureResult<StillCapture> {
        request.validate(MediaKind::StillImage)?;
        let codec = match self.codecs.create(&request.codec.id, &request.codec.options)? {
            Codec::Still(codec) => codec,
            Codec::Video(_) => {
                return Err(CaptureError::InvalidConfig(format!(
                    "codec `{}` is a video codec",
                    request.codec.id
                )));
            }
        };

        let mut source = self.open_source(&request.region)?;
        let bounds = source.capture_bounds();
        let backend = source.backend();

        source.acquire_frame()?;
        let bitmap = match source.lock_frame_bitmap() {
            Ok(bitmap) => bitmap,
            Err(err) => {
                let _ = source.release_frame();
                return Err(err);
            }
        };
        let encoded = match codec.encode_to_image(&bitmap) {
            Ok(encoded) => encoded,
            Err(err) => {
                let _ = source.unlock_frame_bitmap(bitmap);
                let _ = source.release_frame();
                return Err(err);
            }
        };
        let thumbnail = match Thumbnail::from_bitmap(&bitmap, Thumbnail::DEFAULT_MAX_SIDE) {
            Ok(thumbnail) => Some(thumbnail),
            Err(err) => {
                debug!(error = %err, "thumbnail skipped");
                None
            }
        };
        debug!(
            backend = backend.as_str(),
            ?bounds,
            bytes = encoded.bytes.len(),
            media_type = encoded.media_type,
            "still capture encoded"
        );

        let context = SinkContext::new(
            MediaKind::StillImage,
            encoded.media_type,
            encoded.file_extension,
        )
        .with_thumbnail(thumbnail.clone());
        let sinks = self.resolve_sinks(request, &context);

        // Sinks may finish on worker threads; the source is only touched
        // here, once the last one is done with the bitmap.
        let (released_tx, released_rx) = crossbeam_channel::bounded::<()>(1);
        let payload = StillPayload {
            bytes: Arc::clone(&encoded.bytes),
            bitmap: bitmap.clone(),
        };
        let delivery = fan_out(sinks, payload, move || {
            let _ = released_tx.send(());
        });
        if released_rx.recv().is_err() {
            warn!("fan-out ended without releasing the capture");
        }
        if let Err(err) = source.unlock_frame_bitmap(bitmap) {
            warn!(error = %err, "bitmap unlock failed");
        }
        if let Err(err) = source.release_frame() {
            warn!(error = %err, "frame release failed");
        }
        drop(source);

        let report = delivery.join();
        report.log("screenshot");
        Ok(StillCapture {
            media_type: encoded.media_type,
            file_extension: encoded.file_extension,
            bounds,
            backend,
            thumbnail,
            report,
        })
    }

    /// Start a recording on its own thread. Sinks that only take bitmaps
    /// are failed up front.
    pub fn start_recording(&self, request: &CaptureRequest) -> CaptureResult<RecordingSession> {
        request.validate(MediaKind::Video)?;
        let codec = match self.codecs.create(&request.codec.id, &request.codec.options)? {
            Codec::Video(codec) => codec,
            Codec::Still(_) => {
                return Err(CaptureError::InvalidConfig(format!(
                    "codec `{}` is a still image codec",
                    request.codec.id
                )));
            }
        };

        let source = self.open_source(&request.region)?;
        let context = SinkContext::new(MediaKind::Video, codec.media_type(), codec.file_extension());
        let sinks: Vec<SinkHandle> = self
            .resolve_sinks(request, &context)
            .into_iter()
            .map(|handle| {
                if handle.is_live() && handle.delivery() == SinkDelivery::Bitmap {
                    let name = handle.name().to_string();
                    SinkHandle::failed(
                        name.clone(),
                        CaptureError::UnsupportedMedia(format!(
                            "{name} takes bitmaps and cannot receive a video stream"
                        )),
                    )
                } else {
                    handle
                }
            })
            .collect();

        let stream = MultiSinkStream::new(sinks);
        if stream.live_count() == 0 {
            stream.finish().log("recording");
            return Err(CaptureError::sink("recording", "no sink could be opened"));
        }
        info!(
            codec = %request.codec.id,
            sinks = stream.live_count(),
            "starting recording"
        );
        RecordingSession::start(source, codec, stream, self.recording_config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FanOutOutcome;
    use crate::platform::virtual_desktop::{DesktopEvent, ScriptedFrame, VirtualDesktop};
    use crate::sink::{ActionSink, MemoryClipboard, MemorySink, SharedBytes, SinkState};
    use image::ImageFormat;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        desktop: VirtualDesktop,
        clipboard: MemoryClipboard,
        memory: SharedBytes,
        capturer: Capturer,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fixture(width: u32, height: u32) -> CaptureResult<Fixture> {
        init_tracing();
        let desktop = VirtualDesktop::single_output(width, height);
        let clipboard = MemoryClipboard::default();
        let memory = SharedBytes::default();
        let mut sinks = SinkRegistry::with_clipboard(Arc::new(clipboard.clone()));
        let shared = memory.clone();
        sinks.register("memory", move |_, _| {
            Ok(Box::new(MemorySink::new("memory", shared.clone())) as Box<dyn ActionSink>)
        });
        let capturer = Capturer::builder()
            .platform(Arc::new(desktop.clone()))
            .sinks(sinks)
            .recording_config(RecordingConfig {
                frame_rate: Some(50),
                ..RecordingConfig::default()
            })
            .build()?;
        Ok(Fixture {
            desktop,
            clipboard,
            memory,
            capturer,
        })
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("captain-pipeline-{tag}-{}", std::process::id()))
    }

    #[test]
    fn full_hd_png_reaches_file_and_clipboard() -> CaptureResult<()> {
        let fx = fixture(1920, 1080)?;
        let dir = scratch_dir("png");
        let request = CaptureRequest::new(RegionSelector::PrimaryOutput, MediaKind::StillImage, "png")
            .with_codec_options(json!({ "compression": "fast" }))
            .with_sink(
                "file",
                json!({ "directory": dir, "template": "shot.{Extension}", "overwrite": true }),
            )
            .with_sink("clipboard", serde_json::Value::Null);

        let capture = fx.capturer.capture_still(&request)?;
        assert_eq!(capture.report.outcome(), FanOutOutcome::AllSucceeded);
        assert_eq!(capture.backend, BackendKind::Duplication);
        assert_eq!((capture.bounds.width, capture.bounds.height), (1920, 1080));
        assert!(capture.thumbnail.is_some_and(|thumb| thumb.width == 256));

        let file = image::load_from_memory_with_format(&std::fs::read(dir.join("shot.png"))?, ImageFormat::Png)
            .map_err(|err| CaptureError::Encoding(err.to_string()))?
            .to_rgba8();
        assert_eq!(file.dimensions(), (1920, 1080));
        let copied = fx.clipboard.last().ok_or(CaptureError::BufferOverflow)?;
        assert_eq!((copied.width, copied.height), (1920, 1080));
        assert_eq!(copied.rgba, file.into_raw());

        let uri = capture.report.sinks[0]
            .outcome
            .as_ref()
            .and_then(|outcome| outcome.uri.clone());
        assert!(uri.is_some_and(|uri| uri.ends_with("shot.png")));
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn frame_is_released_after_delivery() -> CaptureResult<()> {
        let fx = fixture(320, 200)?;
        let request = CaptureRequest::new(RegionSelector::AllOutputs, MediaKind::StillImage, "bmp")
            .with_sink("memory", serde_json::Value::Null);
        let capture = fx.capturer.capture_still(&request)?;
        assert_eq!(capture.report.outcome(), FanOutOutcome::AllSucceeded);
        assert!(fx.memory.snapshot()?.starts_with(b"BM"));

        let events = fx.desktop.events();
        assert!(events.contains(&DesktopEvent::FrameReleased { output: 0 }));
        assert_eq!(events.last(), Some(&DesktopEvent::DuplicationClosed { output: 0 }));
        Ok(())
    }

    #[test]
    fn broken_sink_does_not_stop_the_others() -> CaptureResult<()> {
        let fx = fixture(64, 64)?;
        let request = CaptureRequest::new(RegionSelector::PrimaryOutput, MediaKind::StillImage, "png")
            .with_sink("memory", serde_json::Value::Null)
            .with_sink("dropbox", serde_json::Value::Null)
            .with_sink("clipboard", serde_json::Value::Null);
        let capture = fx.capturer.capture_still(&request)?;
        assert_eq!(capture.report.outcome(), FanOutOutcome::SomeFailed);
        assert_eq!(capture.report.sinks[1].state, SinkState::Failed);
        assert!(!fx.memory.is_empty());
        assert!(fx.clipboard.last().is_some());
        Ok(())
    }

    #[test]
    fn requests_are_validated_before_capturing() -> CaptureResult<()> {
        let fx = fixture(64, 64)?;
        let no_sinks = CaptureRequest::new(RegionSelector::PrimaryOutput, MediaKind::StillImage, "png");
        assert!(matches!(
            fx.capturer.capture_still(&no_sinks),
            Err(CaptureError::InvalidConfig(_))
        ));

        let video_codec = CaptureRequest::new(RegionSelector::PrimaryOutput, MediaKind::StillImage, "gif-video")
            .with_sink("memory", serde_json::Value::Null);
        assert!(matches!(
            fx.capturer.capture_still(&video_codec),
            Err(CaptureError::InvalidConfig(_))
        ));

        let unknown = CaptureRequest::new(RegionSelector::PrimaryOutput, MediaKind::StillImage, "webp")
            .with_sink("memory", serde_json::Value::Null);
        assert!(matches!(
            fx.capturer.capture_still(&unknown),
            Err(CaptureError::CodecInitialization(_))
        ));
        assert!(fx.desktop.events().is_empty());
        Ok(())
    }

    #[test]
    fn gif_recording_streams_to_memory() -> CaptureResult<()> {
        let fx = fixture(48, 32)?;
        let request = CaptureRequest::new(RegionSelector::PrimaryOutput, MediaKind::Video, "gif-video")
            .with_sink("memory", serde_json::Value::Null)
            .with_sink("clipboard", serde_json::Value::Null);
        let session = fx.capturer.start_recording(&request)?;
        std::thread::sleep(Duration::from_millis(150));
        let report = session.stop()?;

        assert!(report.frames_encoded >= 1);
        assert_eq!(report.sinks.outcome(), FanOutOutcome::SomeFailed);
        assert!(matches!(
            report.sinks.sinks[1].error,
            Some(CaptureError::UnsupportedMedia(_))
        ));
        let bytes = fx.memory.snapshot()?;
        assert!(bytes.starts_with(b"GIF89a"));
        assert_eq!(bytes.last(), Some(&0x3B));
        Ok(())
    }

    #[test]
    fn lost_desktop_before_first_frame_leaves_no_file() -> CaptureResult<()> {
        let fx = fixture(16, 16)?;
        fx.desktop.script(0, [ScriptedFrame::AccessLost]);
        let dir = scratch_dir("lost");
        let request = CaptureRequest::new(RegionSelector::PrimaryOutput, MediaKind::Video, "gif-video")
            .with_sink(
                "file",
                json!({ "directory": dir, "template": "lost.{Extension}", "overwrite": true }),
            )
            .with_sink("memory", serde_json::Value::Null);
        let session = fx.capturer.start_recording(&request)?;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while session.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let report = session.stop()?;

        assert_eq!(report.frames_encoded, 0);
        assert!(matches!(report.loop_error, Some(CaptureError::AccessLost)));
        assert_eq!(report.sinks.outcome(), FanOutOutcome::AllFailed);
        assert!(!dir.join("lost.gif").exists());
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn request_round_trips_through_json() -> CaptureResult<()> {
        let text = r#"{
            "region": { "kind": "fixed", "x": 0, "y": 0, "width": 10, "height": 10 },
            "media": "still_image",
            "codec": { "id": "jpeg", "options": { "quality": 70 } },
            "sinks": [ { "id": "clipboard" } ]
        }"#;
        let request: CaptureRequest =
            serde_json::from_str(text).map_err(|err| CaptureError::InvalidConfig(err.to_string()))?;
        assert_eq!(request.codec.id, "jpeg");
        assert_eq!(request.sinks[0].options, serde_json::Value::Null);
        assert!(matches!(request.region, RegionSelector::Fixed(rect) if rect.width == 10));
        Ok(())
    }
}
