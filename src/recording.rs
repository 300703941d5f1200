//! Continuous capture into a video codec.
//!
//! A [`RecordingSession`] moves its frame source, codec and sink stream onto
//! a dedicated thread that acquires, encodes and paces frames until the
//! session leaves the recording state. The thread hands every resource back
//! when it exits so that [`RecordingSession::stop`] can finalize the codec,
//! then commit the sinks, then drop the source, in that order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::codec::{TICKS_PER_SECOND, Ticks, VideoCodec};
use crate::error::{CaptureError, CaptureResult};
use crate::fanout::FanOutReport;
use crate::region::Rectangle;
use crate::sink::MultiSinkStream;
use crate::source::FrameSource;

const PAUSE_POLL: Duration = Duration::from_millis(20);
const RETRY_BACKOFF: Duration = Duration::from_millis(16);
const DROPPED_FRAME_LOG_EVERY: u64 = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingConfig {
    /// Frames per second. Falls back to the codec's own rate.
    pub frame_rate: Option<u32>,
    /// Consecutive transient acquisition errors tolerated before the
    /// capture loop gives up.
    pub max_consecutive_errors: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            frame_rate: None,
            max_consecutive_errors: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    None,
    Recording,
    Paused,
}

impl RecordingState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Recording => 1,
            Self::Paused => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Recording,
            2 => Self::Paused,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Default)]
struct SharedState(AtomicU8);

impl SharedState {
    fn load(&self) -> RecordingState {
        RecordingState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: RecordingState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    fn transition(&self, from: RecordingState, to: RecordingState) -> CaptureResult<()> {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                CaptureError::InvalidState(format!(
                    "recording is {:?}, not {from:?}",
                    RecordingState::from_u8(actual)
                ))
            })
    }
}

/// Summary returned by [`RecordingSession::stop`].
#[derive(Debug)]
pub struct RecordingReport {
    pub frames_encoded: u64,
    /// Frames whose encode call failed and were skipped.
    pub frames_failed: u64,
    pub sinks: FanOutReport,
    /// Why the capture loop ended before `stop`, if it did.
    pub loop_error: Option<CaptureError>,
}

struct LoopParts {
    source: Box<dyn FrameSource>,
    codec: Box<dyn VideoCodec>,
    stream: MultiSinkStream,
}

struct LoopOutcome {
    parts: LoopParts,
    frames_encoded: u64,
    frames_failed: u64,
    error: Option<CaptureError>,
}

/// Monotonic presentation clock in 100 ns ticks with paused time removed.
#[derive(Debug)]
struct RecordingClock {
    origin: Instant,
    paused_total: Duration,
    paused_at: Option<Instant>,
    last: Option<Ticks>,
}

impl RecordingClock {
    fn start() -> Self {
        Self {
            origin: Instant::now(),
            paused_total: Duration::ZERO,
            paused_at: None,
            last: None,
        }
    }

    fn pause(&mut self) {
        self.paused_at.get_or_insert_with(Instant::now);
    }

    fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += at.elapsed();
        }
    }

    /// Strictly greater than every earlier timestamp.
    fn next_timestamp(&mut self) -> Ticks {
        let running = self.origin.elapsed().saturating_sub(self.paused_total);
        let ticks = u64::try_from(running.as_nanos() / 100).unwrap_or(Ticks::MAX);
        let ticks = match self.last {
            Some(last) if ticks <= last => last + 1,
            _ => ticks,
        };
        self.last = Some(ticks);
        ticks
    }
}

fn frame_interval(frame_rate: u32) -> Duration {
    Duration::from_nanos(TICKS_PER_SECOND / u64::from(frame_rate.max(1)) * 100)
}

/// Handle to a running recording. Dropping it stops the recording.
pub struct RecordingSession {
    state: Arc<SharedState>,
    worker: Option<JoinHandle<LoopOutcome>>,
    bounds: Rectangle,
    frame_rate: u32,
    media_type: &'static str,
    file_extension: &'static str,
}

impl RecordingSession {
    /// Open the codec session sized to the source's capture bounds and
    /// launch the capture loop.
    pub fn start(
        source: Box<dyn FrameSource>,
        mut codec: Box<dyn VideoCodec>,
        mut stream: MultiSinkStream,
        config: RecordingConfig,
    ) -> CaptureResult<Self> {
        let bounds = source.capture_bounds();
        if let Err(err) = codec.initialize(bounds.width, bounds.height, &mut stream) {
            stream.abandon(&err).log("recording");
            return Err(err);
        }

        let frame_rate = config.frame_rate.unwrap_or_else(|| codec.frame_rate()).max(1);
        let media_type = codec.media_type();
        let file_extension = codec.file_extension();
        let state = Arc::new(SharedState::default());
        state.store(RecordingState::Recording);

        let parts = LoopParts {
            source,
            codec,
            stream,
        };
        let loop_state = Arc::clone(&state);
        let interval = frame_interval(frame_rate);
        let max_errors = config.max_consecutive_errors;
        let worker = std::thread::Builder::new()
            .name("captain-recording".to_string())
            .spawn(move || capture_loop(parts, &loop_state, interval, max_errors))
            .map_err(|e| {
                CaptureError::Platform(anyhow::anyhow!("failed to spawn recording thread: {e}"))
            })?;

        info!(
            ?bounds,
            frame_rate,
            media_type,
            "recording started"
        );
        Ok(Self {
            state,
            worker: Some(worker),
            bounds,
            frame_rate,
            media_type,
            file_extension,
        })
    }

    /// `None` once stopped or once the capture loop has ended on its own.
    pub fn state(&self) -> RecordingState {
        self.state.load()
    }

    pub fn bounds(&self) -> Rectangle {
        self.bounds
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn media_type(&self) -> &'static str {
        self.media_type
    }

    pub fn file_extension(&self) -> &'static str {
        self.file_extension
    }

    /// Whether the capture loop thread is still running. It exits on its
    /// own after a fatal error.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn pause(&self) -> CaptureResult<()> {
        self.state
            .transition(RecordingState::Recording, RecordingState::Paused)
    }

    pub fn resume(&self) -> CaptureResult<()> {
        self.state
            .transition(RecordingState::Paused, RecordingState::Recording)
    }

    /// Stop the loop, wait for it, then finalize the codec and commit the
    /// sinks.
    pub fn stop(mut self) -> CaptureResult<RecordingReport> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CaptureResult<RecordingReport> {
        self.state.store(RecordingState::None);
        let worker = self
            .worker
            .take()
            .ok_or_else(|| CaptureError::InvalidState("recording already stopped".into()))?;
        let outcome = worker.join().map_err(|_| CaptureError::WorkerDead)?;

        let LoopOutcome {
            parts,
            frames_encoded,
            frames_failed,
            error,
        } = outcome;
        let LoopParts {
            source,
            mut codec,
            mut stream,
        } = parts;

        let (sinks, loop_error) = match codec.finalize(&mut stream) {
            Ok(()) if frames_encoded == 0 => {
                let err = CaptureError::Encoding("recording produced no frames".into());
                warn!(error = ?error, "recording ended without a frame");
                let sinks = stream.abandon(&err);
                (sinks, error.or(Some(err)))
            }
            Ok(()) => (stream.finish(), error),
            Err(err) => {
                warn!(error = %err, "codec finalize failed");
                let sinks = stream.abandon(&err);
                (sinks, error.or(Some(err)))
            }
        };
        drop(codec);
        drop(source);

        sinks.log("recording");
        debug!(frames_encoded, frames_failed, "recording stopped");
        Ok(RecordingReport {
            frames_encoded,
            frames_failed,
            sinks,
            loop_error,
        })
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.shutdown() {
                warn!(error = %err, "recording did not shut down cleanly");
            }
        }
    }
}

/// Acquire, encode and release one frame. The outer result is the
/// acquisition; the inner one is the encode, which the loop tolerates.
fn capture_one(
    parts: &mut LoopParts,
    clock: &mut RecordingClock,
) -> CaptureResult<CaptureResult<()>> {
    parts.source.acquire_frame()?;
    let bitmap = match parts.source.lock_frame_bitmap() {
        Ok(bitmap) => bitmap,
        Err(err) => {
            let _ = parts.source.release_frame();
            return Err(err);
        }
    };
    let timestamp = clock.next_timestamp();
    let encoded = parts.codec.encode(&bitmap, timestamp, &mut parts.stream);
    let unlocked = parts.source.unlock_frame_bitmap(bitmap);
    let released = parts.source.release_frame();
    unlocked?;
    released?;
    Ok(encoded)
}

/// Dropped frames are warned about on the first one and then periodically.
fn reports_dropped_frame(frames_failed: u64) -> bool {
    frames_failed == 1 || frames_failed % DROPPED_FRAME_LOG_EVERY == 0
}

fn capture_loop(
    mut parts: LoopParts,
    state: &SharedState,
    interval: Duration,
    max_consecutive_errors: usize,
) -> LoopOutcome {
    let mut clock = RecordingClock::start();
    let mut frames_encoded = 0u64;
    let mut frames_failed = 0u64;
    let mut consecutive_errors = 0usize;
    let mut was_paused = false;
    let mut error = None;

    loop {
        match state.load() {
            RecordingState::None => break,
            RecordingState::Paused => {
                if !was_paused {
                    clock.pause();
                    parts.stream.pause();
                    was_paused = true;
                    debug!("recording paused");
                }
                std::thread::sleep(PAUSE_POLL);
                continue;
            }
            RecordingState::Recording => {
                if was_paused {
                    clock.resume();
                    parts.stream.resume();
                    was_paused = false;
                    debug!("recording resumed");
                }
            }
        }

        let frame_start = Instant::now();
        match capture_one(&mut parts, &mut clock) {
            Ok(Ok(())) => {
                consecutive_errors = 0;
                frames_encoded += 1;
            }
            Ok(Err(err)) => {
                consecutive_errors = 0;
                frames_failed += 1;
                if reports_dropped_frame(frames_failed) {
                    warn!(error = %err, frames_failed, "frame dropped");
                }
            }
            Err(err) if err.is_retryable() && !err.requires_source_reset() => {
                consecutive_errors += 1;
                if consecutive_errors > max_consecutive_errors {
                    warn!(error = %err, consecutive_errors, "too many capture errors");
                    error = Some(err);
                    break;
                }
                std::thread::sleep(RETRY_BACKOFF);
                continue;
            }
            Err(err) => {
                warn!(error = %err, "capture loop failed");
                error = Some(err);
                break;
            }
        }

        if parts.stream.live_count() == 0 {
            error = Some(CaptureError::sink("recording", "every sink has failed"));
            break;
        }

        let elapsed = frame_start.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }

    if error.is_some() {
        state.store(RecordingState::None);
    }

    LoopOutcome {
        parts,
        frames_encoded,
        frames_failed,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DisplayPlatform;
    use crate::bitmap::BitmapData;
    use crate::fanout::FanOutOutcome;
    use crate::platform::virtual_desktop::{ScriptedFrame, VirtualDesktop};
    use crate::sink::{MemorySink, SharedBytes, SinkHandle};
    use crate::source::{SourceConfig, create_frame_source};
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        initialized: Option<(u32, u32)>,
        timestamps: Vec<Ticks>,
        finalized: usize,
    }

    /// Writes one marker per call and records what it saw.
    struct RecordingCodec {
        calls: Arc<Mutex<Calls>>,
    }

    impl VideoCodec for RecordingCodec {
        fn media_type(&self) -> &'static str {
            "video/x-test"
        }

        fn file_extension(&self) -> &'static str {
            "bin"
        }

        fn frame_rate(&self) -> u32 {
            100
        }

        fn apply_options(&mut self, _options: &serde_json::Value) -> CaptureResult<()> {
            Ok(())
        }

        fn initialize(&mut self, width: u32, height: u32, output: &mut dyn Write) -> CaptureResult<()> {
            self.calls.lock().map_err(|_| CaptureError::WorkerDead)?.initialized = Some((width, height));
            output.write_all(b"I")?;
            Ok(())
        }

        fn encode(&mut self, bitmap: &BitmapData, timestamp: Ticks, output: &mut dyn Write) -> CaptureResult<()> {
            assert_eq!(bitmap.width(), 64);
            self.calls.lock().map_err(|_| CaptureError::WorkerDead)?.timestamps.push(timestamp);
            output.write_all(b"F")?;
            Ok(())
        }

        fn finalize(&mut self, output: &mut dyn Write) -> CaptureResult<()> {
            self.calls.lock().map_err(|_| CaptureError::WorkerDead)?.finalized += 1;
            output.write_all(b"E")?;
            Ok(())
        }
    }

    fn session(
        desktop: &VirtualDesktop,
        config: RecordingConfig,
    ) -> CaptureResult<(RecordingSession, Arc<Mutex<Calls>>, SharedBytes)> {
        let platform: Arc<dyn DisplayPlatform> = Arc::new(desktop.clone());
        let region = Rectangle::new(0, 0, 64, 48)?;
        let source = create_frame_source(&platform, region, &SourceConfig::default())?;
        let calls = Arc::new(Mutex::new(Calls::default()));
        let bytes = SharedBytes::default();
        let stream = MultiSinkStream::new(vec![SinkHandle::new(Box::new(
            MemorySink::new("memory", bytes.clone()).pausable(),
        ))]);
        let codec = Box::new(RecordingCodec {
            calls: Arc::clone(&calls),
        });
        let session = RecordingSession::start(source, codec, stream, config)?;
        Ok((session, calls, bytes))
    }

    #[test]
    fn timestamps_strictly_increase() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(64, 48);
        let (session, calls, bytes) = session(&desktop, RecordingConfig::default())?;
        assert_eq!(session.state(), RecordingState::Recording);
        std::thread::sleep(Duration::from_millis(200));
        let report = session.stop()?;

        let calls = calls.lock().map_err(|_| CaptureError::WorkerDead)?;
        assert_eq!(calls.initialized, Some((64, 48)));
        assert_eq!(calls.finalized, 1);
        assert!(calls.timestamps.len() >= 2);
        assert!(calls.timestamps.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(report.frames_encoded, calls.timestamps.len() as u64);
        assert!(report.loop_error.is_none());
        assert_eq!(report.sinks.outcome(), FanOutOutcome::AllSucceeded);

        let written = bytes.snapshot()?;
        assert_eq!(written.first(), Some(&b'I'));
        assert_eq!(written.last(), Some(&b'E'));
        assert_eq!(written.len(), calls.timestamps.len() + 2);
        Ok(())
    }

    #[test]
    fn pause_and_resume_follow_the_state_machine() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(64, 48);
        let (session, _calls, _bytes) = session(&desktop, RecordingConfig::default())?;
        assert!(session.resume().is_err());
        session.pause()?;
        assert_eq!(session.state(), RecordingState::Paused);
        assert!(matches!(session.pause(), Err(CaptureError::InvalidState(_))));
        std::thread::sleep(Duration::from_millis(50));
        session.resume()?;
        assert_eq!(session.state(), RecordingState::Recording);
        let report = session.stop()?;
        assert_eq!(report.sinks.outcome(), FanOutOutcome::AllSucceeded);
        Ok(())
    }

    #[test]
    fn access_loss_ends_the_loop_but_stop_still_finalizes() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(64, 48);
        desktop.script(0, [ScriptedFrame::AccessLost]);
        let (session, calls, _bytes) = session(&desktop, RecordingConfig::default())?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(session.state(), RecordingState::None);
        assert!(session.pause().is_err());
        let report = session.stop()?;
        assert!(matches!(report.loop_error, Some(CaptureError::AccessLost)));
        assert_eq!(report.frames_encoded, 0);
        assert_eq!(calls.lock().map_err(|_| CaptureError::WorkerDead)?.finalized, 1);
        Ok(())
    }

    #[test]
    fn recording_without_frames_fails_every_sink() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(64, 48);
        desktop.script(0, [ScriptedFrame::AccessLost]);
        let (session, _calls, _bytes) = session(&desktop, RecordingConfig::default())?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let report = session.stop()?;
        assert_eq!(report.sinks.outcome(), FanOutOutcome::AllFailed);
        assert!(matches!(
            report.sinks.sinks[0].error,
            Some(CaptureError::Encoding(_))
        ));
        assert!(report.sinks.sinks[0].outcome.is_none());
        Ok(())
    }

    #[test]
    fn dropping_a_session_stops_it() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(64, 48);
        let (session, calls, bytes) = session(&desktop, RecordingConfig::default())?;
        std::thread::sleep(Duration::from_millis(30));
        drop(session);
        assert_eq!(calls.lock().map_err(|_| CaptureError::WorkerDead)?.finalized, 1);
        assert_eq!(bytes.snapshot()?.last(), Some(&b'E'));
        Ok(())
    }

    #[test]
    fn dropped_frames_are_reported_periodically() {
        let reported: Vec<u64> = (1..=250).filter(|&n| reports_dropped_frame(n)).collect();
        assert_eq!(reported, vec![1, 100, 200]);
    }

    #[test]
    fn clock_skips_paused_time_and_never_repeats() {
        let mut clock = RecordingClock::start();
        let first = clock.next_timestamp();
        clock.pause();
        std::thread::sleep(Duration::from_millis(30));
        clock.resume();
        let second = clock.next_timestamp();
        assert!(second > first);
        assert!(second - first < 30 * TICKS_PER_SECOND / 1000);
    }
}
