//! In-memory display platform with a deterministic pixel pattern and
//! scriptable acquisition results. Used by tests and by headless callers
//! that want to exercise the full capture pipeline without a compositor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::backend::{
    AcquireOutcome, DesktopBlitter, DisplayPlatform, FrameInfo, OutputDuplication,
    PlatformCapabilities, StagingView, StagingVisitor,
};
use crate::error::{CaptureError, CaptureResult};
use crate::output::OutputId;
use crate::region::{OutputGeometry, Rectangle};

/// Bytes appended to every staging row so copies have to honor strides.
const STAGING_ROW_PADDING: usize = 32;

/// Result injected into the next `acquire_next_frame` call of one output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptedFrame {
    /// A frame lease with zero metadata size.
    Empty,
    /// The acquire timeout elapses without an update.
    NoNewFrame,
    AccessLost,
    Fail(String),
}

/// Observable side effects, in the order they happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DesktopEvent {
    DuplicationOpened { output: usize },
    FrameAcquired { output: usize, empty: bool },
    NoNewFrame { output: usize },
    StagingCopied { output: usize },
    FrameReleased { output: usize },
    DuplicationClosed { output: usize },
    BlitterOpened,
    Blitted(Rectangle),
    BlitterClosed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum DuplicationSupport {
    Supported,
    Unsupported,
    Failing(String),
}

struct DesktopState {
    outputs: Vec<OutputGeometry>,
    duplicate: bool,
    blit: bool,
    duplication: DuplicationSupport,
    scripts: FxHashMap<usize, VecDeque<ScriptedFrame>>,
    present_counter: i64,
    events: Vec<DesktopEvent>,
}

#[derive(Clone)]
pub struct VirtualDesktop {
    state: Arc<Mutex<DesktopState>>,
}

impl Default for VirtualDesktop {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDesktop {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DesktopState {
                outputs: Vec::new(),
                duplicate: true,
                blit: true,
                duplication: DuplicationSupport::Supported,
                scripts: FxHashMap::default(),
                present_counter: 0,
                events: Vec::new(),
            })),
        }
    }

    /// A desktop with one primary output at the origin.
    pub fn single_output(width: u32, height: u32) -> Self {
        Self::new().with_output(Rectangle {
            x: 0,
            y: 0,
            width,
            height,
        })
    }

    /// Append an output. Outputs with even positions sit on adapter 0,
    /// odd ones on adapter 1.
    pub fn with_output(self, bounds: Rectangle) -> Self {
        if let Ok(mut state) = self.state.lock() {
            let index = state.outputs.len();
            let adapter = (index % 2) as u32;
            let output = OutputId::new(
                adapter,
                index as u32,
                0x1000 + u64::from(adapter),
                format!("virtual-{index}"),
                bounds.x == 0 && bounds.y == 0,
            );
            state.outputs.push(OutputGeometry { output, bounds });
        }
        self
    }

    /// Report no duplication capability at all.
    pub fn without_duplication(self) -> Self {
        self.update(|state| state.duplicate = false)
    }

    /// Advertise duplication but fail to open it with
    /// [`CaptureError::BackendUnsupported`], like an old driver would.
    pub fn with_unsupported_duplication(self) -> Self {
        self.update(|state| state.duplication = DuplicationSupport::Unsupported)
    }

    /// Fail duplication creation with a generic platform error.
    pub fn with_failing_duplication(self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.update(|state| state.duplication = DuplicationSupport::Failing(message))
    }

    pub fn without_blit(self) -> Self {
        self.update(|state| state.blit = false)
    }

    /// Queue scripted results for output `index`. Once the script is
    /// exhausted the output produces regular frames.
    pub fn script(&self, index: usize, frames: impl IntoIterator<Item = ScriptedFrame>) {
        if let Ok(mut state) = self.state.lock() {
            state.scripts.entry(index).or_default().extend(frames);
        }
    }

    pub fn events(&self) -> Vec<DesktopEvent> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    pub fn clear_events(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.events.clear();
        }
    }

    /// The BGRA value the desktop shows at a virtual-desktop point, or
    /// `None` outside every output. Pixels carry their output's index so
    /// seams between outputs are detectable.
    pub fn pixel_at(&self, x: i32, y: i32) -> Option<[u8; 4]> {
        let state = self.state.lock().ok()?;
        pattern_pixel(&state.outputs, x, y)
    }

    fn update(self, apply: impl FnOnce(&mut DesktopState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
        self
    }
}

fn pattern_pixel(outputs: &[OutputGeometry], x: i32, y: i32) -> Option<[u8; 4]> {
    let index = outputs
        .iter()
        .position(|geometry| geometry.bounds.contains_point(x, y))?;
    Some([x as u8, y as u8, 0x40 + index as u8, 0xFF])
}

fn lock(state: &Mutex<DesktopState>) -> CaptureResult<MutexGuard<'_, DesktopState>> {
    state
        .lock()
        .map_err(|_| CaptureError::Platform(anyhow::anyhow!("virtual desktop state poisoned")))
}

impl DisplayPlatform for VirtualDesktop {
    fn name(&self) -> &str {
        "virtual"
    }

    fn capabilities(&self) -> PlatformCapabilities {
        self.state
            .lock()
            .map(|state| PlatformCapabilities {
                duplicate: state.duplicate,
                blit: state.blit,
            })
            .unwrap_or_default()
    }

    fn enumerate_outputs(&self) -> CaptureResult<Vec<OutputGeometry>> {
        Ok(lock(&self.state)?.outputs.clone())
    }

    fn open_duplication(
        &self,
        output: &OutputGeometry,
        local: Rectangle,
    ) -> CaptureResult<Box<dyn OutputDuplication>> {
        let mut state = lock(&self.state)?;
        match &state.duplication {
            DuplicationSupport::Supported => {}
            DuplicationSupport::Unsupported => {
                return Err(CaptureError::BackendUnsupported(
                    "virtual desktop duplication disabled".into(),
                ));
            }
            DuplicationSupport::Failing(message) => {
                return Err(CaptureError::Platform(anyhow::anyhow!("{message}")));
            }
        }
        let index = state
            .outputs
            .iter()
            .position(|candidate| candidate == output)
            .ok_or_else(|| CaptureError::InvalidRegion(format!("unknown output {}", output.output)))?;
        if !output.bounds.relative_to(&output.bounds).contains(&local) {
            return Err(CaptureError::InvalidRegion(format!(
                "staging rectangle {local:?} exceeds output {}",
                output.output
            )));
        }
        state.events.push(DesktopEvent::DuplicationOpened { output: index });

        let stride = local.width as usize * 4 + STAGING_ROW_PADDING;
        Ok(Box::new(VirtualDuplication {
            state: Arc::clone(&self.state),
            index,
            origin: (output.bounds.x + local.x, output.bounds.y + local.y),
            local,
            stride,
            staging: vec![0; stride * local.height as usize],
            leased: false,
        }))
    }

    fn open_blitter(&self) -> CaptureResult<Box<dyn DesktopBlitter>> {
        let mut state = lock(&self.state)?;
        if !state.blit {
            return Err(CaptureError::BackendUnavailable(
                "virtual desktop blits disabled".into(),
            ));
        }
        state.events.push(DesktopEvent::BlitterOpened);
        Ok(Box::new(VirtualBlitter {
            state: Arc::clone(&self.state),
            width: 0,
            height: 0,
            bits: Vec::new(),
        }))
    }
}

struct VirtualDuplication {
    state: Arc<Mutex<DesktopState>>,
    index: usize,
    origin: (i32, i32),
    local: Rectangle,
    stride: usize,
    staging: Vec<u8>,
    leased: bool,
}

impl OutputDuplication for VirtualDuplication {
    fn acquire_next_frame(&mut self, _timeout: Duration) -> CaptureResult<AcquireOutcome> {
        if self.leased {
            return Err(CaptureError::InvalidState(
                "previous frame was not released".into(),
            ));
        }
        let mut state = lock(&self.state)?;
        let scripted = state
            .scripts
            .get_mut(&self.index)
            .and_then(|queue| queue.pop_front());
        let output = self.index;
        match scripted {
            Some(ScriptedFrame::NoNewFrame) => {
                state.events.push(DesktopEvent::NoNewFrame { output });
                Ok(AcquireOutcome::NoNewFrame)
            }
            Some(ScriptedFrame::AccessLost) => Err(CaptureError::AccessLost),
            Some(ScriptedFrame::Fail(message)) => {
                Err(CaptureError::Platform(anyhow::anyhow!("{message}")))
            }
            Some(ScriptedFrame::Empty) => {
                self.leased = true;
                state.events.push(DesktopEvent::FrameAcquired {
                    output,
                    empty: true,
                });
                Ok(AcquireOutcome::Frame(FrameInfo::default()))
            }
            None => {
                self.leased = true;
                state.present_counter += 1;
                state.events.push(DesktopEvent::FrameAcquired {
                    output,
                    empty: false,
                });
                Ok(AcquireOutcome::Frame(FrameInfo {
                    metadata_size: 64,
                    last_present_time: state.present_counter,
                    accumulated_frames: 1,
                }))
            }
        }
    }

    fn copy_to_staging(&mut self) -> CaptureResult<()> {
        if !self.leased {
            return Err(CaptureError::InvalidState("no frame is leased".into()));
        }
        let mut state = lock(&self.state)?;
        for row in 0..self.local.height as usize {
            for col in 0..self.local.width as usize {
                let px = pattern_pixel(
                    &state.outputs,
                    self.origin.0 + col as i32,
                    self.origin.1 + row as i32,
                )
                .unwrap_or_default();
                let at = row * self.stride + col * 4;
                self.staging[at..at + 4].copy_from_slice(&px);
            }
        }
        state.events.push(DesktopEvent::StagingCopied { output: self.index });
        Ok(())
    }

    fn release_frame(&mut self) -> CaptureResult<()> {
        if self.leased {
            self.leased = false;
            lock(&self.state)?
                .events
                .push(DesktopEvent::FrameReleased { output: self.index });
        }
        Ok(())
    }

    fn read_staging(&mut self, visit: &mut StagingVisitor<'_>) -> CaptureResult<()> {
        visit(StagingView {
            width: self.local.width,
            height: self.local.height,
            stride: self.stride,
            bytes: &self.staging,
        })
    }
}

impl Drop for VirtualDuplication {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state
                .events
                .push(DesktopEvent::DuplicationClosed { output: self.index });
        }
    }
}

struct VirtualBlitter {
    state: Arc<Mutex<DesktopState>>,
    width: u32,
    height: u32,
    bits: Vec<u8>,
}

impl DesktopBlitter for VirtualBlitter {
    fn blit(&mut self, region: Rectangle) -> CaptureResult<()> {
        let mut state = lock(&self.state)?;
        self.width = region.width;
        self.height = region.height;
        self.bits.clear();
        self.bits
            .reserve(region.width as usize * region.height as usize * 4);
        for row in 0..region.height as i32 {
            for col in 0..region.width as i32 {
                let px = pattern_pixel(&state.outputs, region.x + col, region.y + row)
                    .unwrap_or_default();
                self.bits.extend_from_slice(&px);
            }
        }
        state.events.push(DesktopEvent::Blitted(region));
        Ok(())
    }

    fn read(&mut self, visit: &mut StagingVisitor<'_>) -> CaptureResult<()> {
        visit(StagingView {
            width: self.width,
            height: self.height,
            stride: self.width as usize * 4,
            bytes: &self.bits,
        })
    }
}

impl Drop for VirtualBlitter {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.events.push(DesktopEvent::BlitterClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_tags_each_output() {
        let desktop = VirtualDesktop::single_output(100, 100).with_output(Rectangle {
            x: 100,
            y: 0,
            width: 50,
            height: 50,
        });
        assert_eq!(desktop.pixel_at(3, 4), Some([3, 4, 0x40, 0xFF]));
        assert_eq!(desktop.pixel_at(101, 4), Some([101, 4, 0x41, 0xFF]));
        assert_eq!(desktop.pixel_at(120, 80), None);
    }

    #[test]
    fn scripted_frames_are_consumed_in_order() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(8, 8);
        desktop.script(0, [ScriptedFrame::NoNewFrame, ScriptedFrame::Empty]);
        let output = desktop.enumerate_outputs()?.remove(0);
        let mut dup = desktop.open_duplication(&output, Rectangle::new(0, 0, 8, 8)?)?;

        let timeout = Duration::from_millis(1);
        assert_eq!(dup.acquire_next_frame(timeout)?, AcquireOutcome::NoNewFrame);
        assert_eq!(
            dup.acquire_next_frame(timeout)?,
            AcquireOutcome::Frame(FrameInfo::default())
        );
        assert!(dup.acquire_next_frame(timeout).is_err());
        dup.release_frame()?;
        assert!(matches!(
            dup.acquire_next_frame(timeout)?,
            AcquireOutcome::Frame(FrameInfo {
                metadata_size: 64,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn staging_outside_output_is_rejected() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(8, 8);
        let output = desktop.enumerate_outputs()?.remove(0);
        assert!(
            desktop
                .open_duplication(&output, Rectangle::new(4, 4, 8, 8)?)
                .is_err()
        );
        Ok(())
    }
}
