use std::sync::Arc;
use std::time::Duration;

use crate::error::{CaptureError, CaptureResult};
use crate::region::{DesktopLayout, OutputGeometry, Rectangle};

/// The two frame-acquisition strategies a frame source can be built on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// One desktop-duplication handle per intersecting output.
    Duplication,
    /// A single bit-block copy from the desktop device context.
    Blit,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Duplication => "duplication",
            Self::Blit => "blit",
        }
    }
}

/// Which acquisition primitives the platform exposes. Queried once when a
/// frame source is built so backend selection does not probe per capture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlatformCapabilities {
    pub duplicate: bool,
    pub blit: bool,
}

/// Metadata returned with a duplicated desktop frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Size of the move/dirty metadata attached to the frame. Zero means
    /// the frame carries no new desktop content.
    pub metadata_size: u32,
    /// Platform presentation timestamp of the last desktop update.
    pub last_present_time: i64,
    pub accumulated_frames: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A frame lease is held and must be released with
    /// [`OutputDuplication::release_frame`].
    Frame(FrameInfo),
    /// The timeout elapsed without a desktop update. No lease is held.
    NoNewFrame,
}

/// CPU-readable pixels of a staging surface, valid only for the duration
/// of the visitor call that receives it.
#[derive(Clone, Copy, Debug)]
pub struct StagingView<'a> {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub bytes: &'a [u8],
}

impl<'a> StagingView<'a> {
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.height {
            return None;
        }
        let start = (y as usize).checked_mul(self.stride)?;
        let len = (self.width as usize).checked_mul(4)?;
        self.bytes.get(start..start.checked_add(len)?)
    }
}

pub type StagingVisitor<'v> = dyn FnMut(StagingView<'_>) -> CaptureResult<()> + 'v;

/// Desktop duplication of a single output, bound to one staging buffer
/// sized to the output-local rectangle it was opened with.
pub trait OutputDuplication: Send {
    fn acquire_next_frame(&mut self, timeout: Duration) -> CaptureResult<AcquireOutcome>;

    /// Copy the staged rectangle out of the currently leased desktop
    /// surface. Only valid while a frame lease is held.
    fn copy_to_staging(&mut self) -> CaptureResult<()>;

    fn release_frame(&mut self) -> CaptureResult<()>;

    /// Map the staging buffer and hand its rows to `visit`.
    fn read_staging(&mut self, visit: &mut StagingVisitor<'_>) -> CaptureResult<()>;
}

/// Slow-path desktop copy into a CPU bitmap.
pub trait DesktopBlitter: Send {
    fn blit(&mut self, region: Rectangle) -> CaptureResult<()>;

    fn read(&mut self, visit: &mut StagingVisitor<'_>) -> CaptureResult<()>;
}

/// Output enumeration plus the two acquisition primitives.
pub trait DisplayPlatform: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> PlatformCapabilities;

    fn enumerate_outputs(&self) -> CaptureResult<Vec<OutputGeometry>>;

    fn layout(&self) -> CaptureResult<DesktopLayout> {
        DesktopLayout::new(self.enumerate_outputs()?)
    }

    /// Open a duplication for `output` with a staging buffer covering
    /// `local`, a rectangle relative to the output's top-left corner.
    ///
    /// Returns [`CaptureError::BackendUnsupported`] when the platform or
    /// driver cannot duplicate this output.
    fn open_duplication(
        &self,
        output: &OutputGeometry,
        local: Rectangle,
    ) -> CaptureResult<Box<dyn OutputDuplication>>;

    fn open_blitter(&self) -> CaptureResult<Box<dyn DesktopBlitter>> {
        Err(CaptureError::BackendUnavailable(format!(
            "{} does not support desktop blits",
            self.name()
        )))
    }
}

/// The native display platform for the current OS.
pub fn default_platform() -> CaptureResult<Arc<dyn DisplayPlatform>> {
    crate::platform::build_platform()
}
