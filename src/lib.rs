//! Desktop region capture, still and video encoding, and delivery of the
//! result to several destinations at once.
//!
//! A [`CaptureRequest`] names a region, a codec and a list of sinks. The
//! [`Capturer`] builds a [`FrameSource`] for the region, encodes what it
//! captures and fans the bytes out to every sink, isolating sink failures
//! from each other. Recordings run on their own thread through a
//! [`RecordingSession`].

pub mod backend;
pub mod bitmap;
pub mod codec;
pub mod convert;
pub(crate) mod env_config;
pub mod error;
pub mod fanout;
pub mod output;
pub mod pipeline;
mod platform;
pub mod recording;
pub mod region;
pub mod sink;
pub mod source;
pub(crate) mod stitch;

pub use backend::{BackendKind, DisplayPlatform, PlatformCapabilities, default_platform};
pub use bitmap::{BitmapData, LockToken, PixelFormat, Thumbnail};
pub use codec::{Codec, CodecRegistry, EncodedImage, MediaKind, StillImageCodec, VideoCodec};
pub use error::{CaptureError, CaptureErrorClass, CaptureResult};
pub use fanout::{FanOutOutcome, FanOutReport, SinkReport};
pub use output::OutputId;
pub use pipeline::{CaptureRequest, Capturer, CapturerBuilder, CodecSpec, SinkSpec, StillCapture};
pub use platform::virtual_desktop::{DesktopEvent, ScriptedFrame, VirtualDesktop};
pub use recording::{RecordingConfig, RecordingReport, RecordingSession, RecordingState};
pub use region::{DesktopLayout, OutputGeometry, Rectangle, RegionSelector};
pub use sink::{ActionSink, MultiSinkStream, SinkHandle, SinkRegistry, SinkState};
pub use source::{FrameSource, SourceConfig, create_frame_source};
