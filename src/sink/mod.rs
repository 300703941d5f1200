//! Capture destinations.
//!
//! An [`ActionSink`] receives either the encoded byte stream or the raw
//! bitmap of one capture. Every sink is wrapped in a [`SinkHandle`] that
//! owns its status; a failure in one handle never touches another.

mod clipboard;
mod file;
mod memory;

use std::io;
use std::sync::Arc;

use chrono::NaiveDateTime;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::bitmap::{BitmapData, Thumbnail};
use crate::codec::MediaKind;
use crate::error::{CaptureError, CaptureResult};
use crate::fanout::{FanOutReport, SinkReport};

pub use clipboard::{ArboardClipboard, ClipboardImage, ClipboardProvider, ClipboardSink, MemoryClipboard};
pub use file::{FileSink, FileSinkOptions, render_file_name};
pub use memory::{MemorySink, SharedBytes};

pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// How a sink wants to receive a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkDelivery {
    /// Encoded bytes through `write`.
    Stream,
    /// The unencoded bitmap through `set_bitmap_data`.
    Bitmap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    Ongoing,
    Paused,
    Success,
    Failed,
}

impl SinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// What a sink hands back on success.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkOutcome {
    /// Where the capture ended up, e.g. a `file://` URI.
    pub uri: Option<String>,
    pub thumbnail: Option<Thumbnail>,
}

/// Capture details a sink factory may use to configure its sink.
#[derive(Clone, Debug)]
pub struct SinkContext {
    pub media: MediaKind,
    pub media_type: &'static str,
    pub file_extension: &'static str,
    /// Local wall-clock time of the capture.
    pub captured_at: NaiveDateTime,
    pub thumbnail: Option<Thumbnail>,
}

impl SinkContext {
    pub fn new(media: MediaKind, media_type: &'static str, file_extension: &'static str) -> Self {
        Self {
            media,
            media_type,
            file_extension,
            captured_at: chrono::Local::now().naive_local(),
            thumbnail: None,
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: Option<Thumbnail>) -> Self {
        self.thumbnail = thumbnail;
        self
    }
}

pub trait ActionSink: Send {
    fn name(&self) -> &str;

    fn delivery(&self) -> SinkDelivery {
        SinkDelivery::Stream
    }

    fn accepts(&self, _media: MediaKind) -> bool {
        true
    }

    /// Chunk size used when a still capture is copied into this sink.
    fn buffer_size(&self) -> usize {
        DEFAULT_BUFFER_SIZE
    }

    fn supports_pause(&self) -> bool {
        false
    }

    /// Announce the total number of bytes that will be written.
    fn set_length(&mut self, _length: u64) -> CaptureResult<()> {
        Ok(())
    }

    fn write(&mut self, _bytes: &[u8]) -> CaptureResult<()> {
        Err(CaptureError::sink(self.name(), "does not accept byte streams"))
    }

    fn set_bitmap_data(&mut self, _bitmap: &BitmapData) -> CaptureResult<()> {
        Err(CaptureError::sink(self.name(), "does not accept bitmaps"))
    }

    fn commit(&mut self) -> CaptureResult<SinkOutcome>;

    /// Discard partial output after a failure.
    fn abort(&mut self) {}
}

/// A sink plus the status machine guarding it.
pub struct SinkHandle {
    name: String,
    sink: Option<Box<dyn ActionSink>>,
    delivery: SinkDelivery,
    buffer_size: usize,
    supports_pause: bool,
    state: SinkState,
    error: Option<CaptureError>,
    outcome: Option<SinkOutcome>,
    used: Option<SinkDelivery>,
    bytes_written: u64,
    expected_length: Option<u64>,
}

impl SinkHandle {
    pub fn new(sink: Box<dyn ActionSink>) -> Self {
        Self {
            name: sink.name().to_string(),
            delivery: sink.delivery(),
            buffer_size: sink.buffer_size().max(1),
            supports_pause: sink.supports_pause(),
            sink: Some(sink),
            state: SinkState::Ongoing,
            error: None,
            outcome: None,
            used: None,
            bytes_written: 0,
            expected_length: None,
        }
    }

    /// Placeholder for a sink that could not be constructed.
    pub fn failed(name: impl Into<String>, error: CaptureError) -> Self {
        let name = name.into();
        warn!(sink = %name, error = %error, "sink unavailable");
        Self {
            name,
            sink: None,
            delivery: SinkDelivery::Stream,
            buffer_size: DEFAULT_BUFFER_SIZE,
            supports_pause: false,
            state: SinkState::Failed,
            error: Some(error),
            outcome: None,
            used: None,
            bytes_written: 0,
            expected_length: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn delivery(&self) -> SinkDelivery {
        self.delivery
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn error(&self) -> Option<&CaptureError> {
        self.error.as_ref()
    }

    pub fn outcome(&self) -> Option<&SinkOutcome> {
        self.outcome.as_ref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Fraction of the announced length written so far.
    pub fn progress(&self) -> Option<f64> {
        match self.expected_length {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_written as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn set_length(&mut self, length: u64) -> CaptureResult<()> {
        self.ensure_writable(SinkDelivery::Stream)?;
        self.expected_length = Some(length);
        let result = self.with_sink(|sink| sink.set_length(length));
        self.settle(result)
    }

    pub fn write(&mut self, bytes: &[u8]) -> CaptureResult<()> {
        self.ensure_writable(SinkDelivery::Stream)?;
        self.used = Some(SinkDelivery::Stream);
        let result = self.with_sink(|sink| sink.write(bytes));
        if result.is_ok() {
            self.bytes_written += bytes.len() as u64;
        }
        self.settle(result)
    }

    pub fn set_bitmap_data(&mut self, bitmap: &BitmapData) -> CaptureResult<()> {
        self.ensure_writable(SinkDelivery::Bitmap)?;
        self.used = Some(SinkDelivery::Bitmap);
        let result = self.with_sink(|sink| sink.set_bitmap_data(bitmap));
        self.settle(result)
    }

    pub fn pause(&mut self) -> CaptureResult<()> {
        if !self.supports_pause {
            return Err(CaptureError::InvalidState(format!(
                "sink {} cannot pause",
                self.name
            )));
        }
        self.transition(SinkState::Ongoing, SinkState::Paused)
    }

    pub fn resume(&mut self) -> CaptureResult<()> {
        self.transition(SinkState::Paused, SinkState::Ongoing)
    }

    /// Finish the sink. A paused sink is resumed first.
    pub fn commit(&mut self) -> CaptureResult<()> {
        if self.state == SinkState::Paused {
            self.state = SinkState::Ongoing;
        }
        self.ensure_live()?;
        match self.with_sink(|sink| sink.commit()) {
            Ok(outcome) => {
                debug!(sink = %self.name, bytes = self.bytes_written, "sink committed");
                self.state = SinkState::Success;
                self.outcome = Some(outcome);
                Ok(())
            }
            Err(err) => self.settle(Err(err)),
        }
    }

    /// Move a live sink to `Failed`. Terminal sinks are left untouched.
    pub fn fail(&mut self, error: CaptureError) {
        if self.state.is_terminal() {
            return;
        }
        warn!(sink = %self.name, error = %error, "sink failed");
        if let Some(sink) = self.sink.as_mut() {
            sink.abort();
        }
        self.state = SinkState::Failed;
        self.error = Some(error);
    }

    pub fn report(&self) -> SinkReport {
        SinkReport {
            name: self.name.clone(),
            state: self.state,
            error: self.error.as_ref().map(CaptureError::to_sendable),
            outcome: self.outcome.clone(),
            bytes_written: self.bytes_written,
        }
    }

    fn ensure_live(&self) -> CaptureResult<()> {
        match self.state {
            SinkState::Ongoing => Ok(()),
            state => Err(CaptureError::InvalidState(format!(
                "sink {} is {state:?}",
                self.name
            ))),
        }
    }

    fn ensure_writable(&self, path: SinkDelivery) -> CaptureResult<()> {
        self.ensure_live()?;
        match self.used {
            Some(used) if used != path => Err(CaptureError::InvalidState(format!(
                "sink {} already received {used:?} data",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    fn transition(&mut self, from: SinkState, to: SinkState) -> CaptureResult<()> {
        if self.state != from {
            return Err(CaptureError::InvalidState(format!(
                "sink {} is {:?}, not {from:?}",
                self.name, self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    fn with_sink<T>(
        &mut self,
        op: impl FnOnce(&mut dyn ActionSink) -> CaptureResult<T>,
    ) -> CaptureResult<T> {
        match self.sink.as_mut() {
            Some(sink) => op(sink.as_mut()),
            None => Err(CaptureError::sink(&self.name, "sink was never constructed")),
        }
    }

    /// Record a failed sink call and hand back a copy of its error.
    fn settle(&mut self, result: CaptureResult<()>) -> CaptureResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let copy = err.to_sendable();
                self.fail(err);
                Err(copy)
            }
        }
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

pub type SinkFactory = Arc<
    dyn Fn(&SinkContext, &serde_json::Value) -> CaptureResult<Box<dyn ActionSink>> + Send + Sync,
>;

/// Sink id to factory mapping.
#[derive(Clone)]
pub struct SinkRegistry {
    factories: FxHashMap<String, SinkFactory>,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl SinkRegistry {
    pub fn empty() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// `file` and `clipboard` (system clipboard through arboard).
    pub fn with_builtin() -> Self {
        Self::with_clipboard(Arc::new(ArboardClipboard))
    }

    /// Built-in sinks with a custom clipboard backend.
    pub fn with_clipboard(provider: Arc<dyn ClipboardProvider>) -> Self {
        let mut registry = Self::empty();
        registry.register("file", |context, options| {
            Ok(Box::new(FileSink::from_options(context, options)?) as Box<dyn ActionSink>)
        });
        registry.register("clipboard", move |_, options| {
            if !matches!(options, serde_json::Value::Null)
                && options.as_object().is_none_or(|map| !map.is_empty())
            {
                return Err(CaptureError::InvalidConfig(
                    "clipboard takes no options".into(),
                ));
            }
            Ok(Box::new(ClipboardSink::new(Arc::clone(&provider))) as Box<dyn ActionSink>)
        });
        registry
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&SinkContext, &serde_json::Value) -> CaptureResult<Box<dyn ActionSink>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Build the sink `id`. Failures come back as a failed handle so the
    /// remaining sinks of the capture are unaffected.
    pub fn resolve(&self, id: &str, options: &serde_json::Value, context: &SinkContext) -> SinkHandle {
        let Some(factory) = self.factories.get(id) else {
            return SinkHandle::failed(id, CaptureError::sink(id, "unknown sink"));
        };
        match factory(context, options) {
            Ok(sink) if !sink.accepts(context.media) => SinkHandle::failed(
                sink.name(),
                CaptureError::UnsupportedMedia(format!(
                    "{} does not accept {}",
                    sink.name(),
                    context.media.as_str()
                )),
            ),
            Ok(sink) => SinkHandle::new(sink),
            Err(err) => SinkHandle::failed(id, err),
        }
    }
}

/// One byte stream written to many sinks. Writes fail only when no sink
/// is left to receive them.
#[derive(Debug)]
pub struct MultiSinkStream {
    sinks: Vec<SinkHandle>,
}

impl MultiSinkStream {
    pub fn new(sinks: Vec<SinkHandle>) -> Self {
        Self { sinks }
    }

    pub fn sinks(&self) -> &[SinkHandle] {
        &self.sinks
    }

    pub fn live_count(&self) -> usize {
        self.sinks.iter().filter(|sink| sink.is_live()).count()
    }

    /// Pause every sink that supports it.
    pub fn pause(&mut self) {
        for sink in self.sinks.iter_mut().filter(|sink| sink.supports_pause) {
            if let Err(err) = sink.pause() {
                debug!(sink = %sink.name(), error = %err, "pause skipped");
            }
        }
    }

    pub fn resume(&mut self) {
        for sink in self.sinks.iter_mut() {
            if sink.state() == SinkState::Paused {
                if let Err(err) = sink.resume() {
                    debug!(sink = %sink.name(), error = %err, "resume skipped");
                }
            }
        }
    }

    /// Commit every live sink and report.
    pub fn finish(mut self) -> FanOutReport {
        for sink in self.sinks.iter_mut().filter(|sink| sink.is_live()) {
            // Commit failures are recorded on the handle.
            let _ = sink.commit();
        }
        FanOutReport::from_handles(&self.sinks)
    }

    /// Fail every live sink with `error` and report.
    pub fn abandon(mut self, error: &CaptureError) -> FanOutReport {
        for sink in self.sinks.iter_mut() {
            sink.fail(error.to_sendable());
        }
        FanOutReport::from_handles(&self.sinks)
    }
}

impl io::Write for MultiSinkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut delivered = false;
        for sink in self.sinks.iter_mut() {
            if sink.state() == SinkState::Ongoing && sink.write(buf).is_ok() {
                delivered = true;
            }
        }
        if delivered || self.sinks.iter().any(|sink| sink.state() == SinkState::Paused) {
            Ok(buf.len())
        } else {
            Err(io::Error::other("every sink has failed"))
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
