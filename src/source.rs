//! Frame acquisition over a capture rectangle.
//!
//! A [`FrameSource`] is built once per capture region by
//! [`create_frame_source`], which decides between the duplication and blit
//! backends exactly once. Every call on a source must come from the thread
//! that owns it; sources are `Send` so they can be moved onto a recording
//! thread, but they are never shared.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::backend::{
    AcquireOutcome, BackendKind, DesktopBlitter, DisplayPlatform, OutputDuplication, StagingView,
};
use crate::bitmap::{BitmapData, FrameBuffer, LockToken};
use crate::env_config::{
    ACQUIRE_TIMEOUT_VAR, FORCE_BLIT_VAR, MAX_EMPTY_FRAMES_VAR, define_env_flag,
    env_var_positive_u64,
};
use crate::error::{CaptureError, CaptureResult};
use crate::region::Rectangle;
use crate::stitch::{CopyRect, StitchPlan, StitchRegion, copy_rows, stitch_region};

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_MAX_EMPTY_FRAMES: u32 = 120;
const DEFAULT_MAX_ACQUIRE_TIMEOUTS: u32 = 10;

define_env_flag!(enabled_when(force_blit_from_env, FORCE_BLIT_VAR));

/// Acquisition tuning for one frame source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    /// Bound on a single platform acquire call.
    pub acquire_timeout: Duration,
    /// Empty-metadata frames skipped per output before an acquire fails
    /// with [`CaptureError::Timeout`].
    pub max_empty_frames: u32,
    /// Consecutive "no new frame" results tolerated for an output that has
    /// never produced content.
    pub max_acquire_timeouts: u32,
    /// Skip duplication and always build the blit backend.
    pub force_blit: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: env_var_positive_u64(ACQUIRE_TIMEOUT_VAR)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
            max_empty_frames: env_var_positive_u64(MAX_EMPTY_FRAMES_VAR)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(DEFAULT_MAX_EMPTY_FRAMES),
            max_acquire_timeouts: DEFAULT_MAX_ACQUIRE_TIMEOUTS,
            force_blit: force_blit_from_env(),
        }
    }
}

/// Backend-specific frame acquisition for one capture rectangle.
pub trait FrameSource: Send {
    fn backend(&self) -> BackendKind;

    /// The rectangle the produced bitmaps cover, in virtual-desktop
    /// coordinates. This is the union of the per-output intersections and
    /// can be smaller than the requested region.
    fn capture_bounds(&self) -> Rectangle;

    /// Refresh the source's pixels, blocking up to the configured timeout
    /// per attempt. Fails with [`CaptureError::InvalidState`] while a
    /// bitmap is locked.
    fn acquire_frame(&mut self) -> CaptureResult<()>;

    /// Drop any frame-scoped state. Idempotent.
    fn release_frame(&mut self) -> CaptureResult<()>;

    /// Expose the acquired frame as a freshly stitched bitmap. Only one
    /// lock may be outstanding at a time.
    fn lock_frame_bitmap(&mut self) -> CaptureResult<BitmapData>;

    fn unlock_frame_bitmap(&mut self, bitmap: BitmapData) -> CaptureResult<()>;
}

/// Build a frame source for `region`, preferring desktop duplication.
///
/// Duplication is attempted when the platform advertises it and blits are
/// not forced. Only [`CaptureError::BackendUnsupported`] falls back to the
/// blit backend; every other failure is returned to the caller.
pub fn create_frame_source(
    platform: &Arc<dyn DisplayPlatform>,
    region: Rectangle,
    config: &SourceConfig,
) -> CaptureResult<Box<dyn FrameSource>> {
    let layout = platform.layout()?;
    let plan = StitchPlan::new(&layout, region)?;
    let capabilities = platform.capabilities();

    if capabilities.duplicate && !config.force_blit {
        match DuplicationSource::open(platform.as_ref(), &plan, config.clone()) {
            Ok(source) => {
                debug!(
                    platform = platform.name(),
                    backend = BackendKind::Duplication.as_str(),
                    outputs = plan.regions().len(),
                    bounds = ?plan.bounds(),
                    "frame source created"
                );
                return Ok(Box::new(source));
            }
            Err(CaptureError::BackendUnsupported(reason)) => {
                warn!(
                    platform = platform.name(),
                    %reason,
                    "desktop duplication unsupported, falling back to blit"
                );
            }
            Err(err) => return Err(err),
        }
    }

    if !capabilities.blit {
        return Err(CaptureError::BackendUnavailable(format!(
            "{} offers no usable capture backend",
            platform.name()
        )));
    }
    let source = BlitSource::open(platform.as_ref(), plan.bounds())?;
    debug!(
        platform = platform.name(),
        backend = BackendKind::Blit.as_str(),
        bounds = ?plan.bounds(),
        "frame source created"
    );
    Ok(Box::new(source))
}

/// Single-outstanding-lock bookkeeping shared by both backends.
#[derive(Debug, Default)]
struct BitmapLocks {
    next: u64,
    outstanding: Option<LockToken>,
}

impl BitmapLocks {
    fn ensure_unlocked(&self) -> CaptureResult<()> {
        match self.outstanding {
            Some(token) => Err(CaptureError::InvalidState(format!(
                "frame bitmap is already locked (token {})",
                token.value()
            ))),
            None => Ok(()),
        }
    }

    fn lock(&mut self) -> CaptureResult<LockToken> {
        self.ensure_unlocked()?;
        self.next = self.next.wrapping_add(1);
        let token = LockToken::new(self.next);
        self.outstanding = Some(token);
        Ok(token)
    }

    fn unlock(&mut self, token: LockToken) -> CaptureResult<()> {
        match self.outstanding {
            Some(held) if held == token => {
                self.outstanding = None;
                Ok(())
            }
            Some(held) => Err(CaptureError::InvalidState(format!(
                "unlock token {} does not match outstanding lock {}",
                token.value(),
                held.value()
            ))),
            None => Err(CaptureError::InvalidState(
                "no frame bitmap is locked".into(),
            )),
        }
    }

    fn is_locked(&self) -> bool {
        self.outstanding.is_some()
    }
}

struct OutputSlot {
    region: StitchRegion,
    duplication: Box<dyn OutputDuplication>,
    leased: bool,
    staged: bool,
}

impl OutputSlot {
    fn release_lease(&mut self) -> CaptureResult<()> {
        if self.leased {
            self.duplication.release_frame()?;
            self.leased = false;
        }
        Ok(())
    }
}

/// Close duplications newest-first.
fn close_in_reverse(slots: &mut Vec<OutputSlot>) {
    while let Some(slot) = slots.pop() {
        trace!(output = %slot.region.output.output, "closing duplication");
        drop(slot);
    }
}

/// One duplication handle and staging buffer per intersecting output,
/// indexed in parallel with the stitch plan's regions.
pub(crate) struct DuplicationSource {
    bounds: Rectangle,
    slots: Vec<OutputSlot>,
    config: SourceConfig,
    locks: BitmapLocks,
    frame_ready: bool,
    unusable: Option<String>,
}

impl DuplicationSource {
    fn open(
        platform: &dyn DisplayPlatform,
        plan: &StitchPlan,
        config: SourceConfig,
    ) -> CaptureResult<Self> {
        let mut slots = Vec::with_capacity(plan.regions().len());
        for region in plan.regions() {
            match platform.open_duplication(&region.output, region.local) {
                Ok(duplication) => slots.push(OutputSlot {
                    region: region.clone(),
                    duplication,
                    leased: false,
                    staged: false,
                }),
                Err(err) => {
                    close_in_reverse(&mut slots);
                    return Err(err);
                }
            }
        }
        Ok(Self {
            bounds: plan.bounds(),
            slots,
            config,
            locks: BitmapLocks::default(),
            frame_ready: false,
            unusable: None,
        })
    }

    fn acquire_output(&mut self, index: usize) -> CaptureResult<()> {
        let timeout = self.config.acquire_timeout;
        let max_empty = self.config.max_empty_frames;
        let max_timeouts = self.config.max_acquire_timeouts;
        let slot = &mut self.slots[index];
        let mut empty_frames = 0u32;
        let mut timeouts = 0u32;

        loop {
            match slot.duplication.acquire_next_frame(timeout)? {
                AcquireOutcome::NoNewFrame => {
                    if slot.staged {
                        // Desktop unchanged; the staged pixels are current.
                        return Ok(());
                    }
                    timeouts += 1;
                    if timeouts >= max_timeouts {
                        warn!(
                            output = %slot.region.output.output,
                            timeouts,
                            "output produced no frame"
                        );
                        return Err(CaptureError::Timeout);
                    }
                }
                AcquireOutcome::Frame(info) => {
                    slot.leased = true;
                    if info.metadata_size == 0 {
                        slot.release_lease()?;
                        empty_frames += 1;
                        if empty_frames > max_empty {
                            warn!(
                                output = %slot.region.output.output,
                                empty_frames,
                                "duplication keeps returning empty frames"
                            );
                            return Err(CaptureError::Timeout);
                        }
                        continue;
                    }
                    let copied = slot.duplication.copy_to_staging();
                    slot.release_lease()?;
                    copied?;
                    slot.staged = true;
                    return Ok(());
                }
            }
        }
    }

    fn ensure_usable(&self) -> CaptureResult<()> {
        match &self.unusable {
            Some(cause) => Err(CaptureError::InvalidState(format!(
                "frame source must be recreated after: {cause}"
            ))),
            None => Ok(()),
        }
    }
}

impl FrameSource for DuplicationSource {
    fn backend(&self) -> BackendKind {
        BackendKind::Duplication
    }

    fn capture_bounds(&self) -> Rectangle {
        self.bounds
    }

    fn acquire_frame(&mut self) -> CaptureResult<()> {
        self.ensure_usable()?;
        if self.locks.is_locked() {
            return Err(CaptureError::InvalidState(
                "cannot acquire a frame while its bitmap is locked".into(),
            ));
        }
        self.release_frame()?;

        for index in 0..self.slots.len() {
            if let Err(err) = self.acquire_output(index) {
                if err.requires_source_reset() || !err.is_retryable() {
                    self.unusable = Some(err.to_string());
                }
                return Err(err);
            }
        }
        self.frame_ready = true;
        Ok(())
    }

    fn release_frame(&mut self) -> CaptureResult<()> {
        self.frame_ready = false;
        for slot in &mut self.slots {
            slot.release_lease()?;
        }
        Ok(())
    }

    fn lock_frame_bitmap(&mut self) -> CaptureResult<BitmapData> {
        self.ensure_usable()?;
        if !self.frame_ready {
            return Err(CaptureError::InvalidState("no frame has been acquired".into()));
        }
        self.locks.ensure_unlocked()?;

        let mut buffer = FrameBuffer::zeroed(self.bounds.width, self.bounds.height)?;
        for slot in &mut self.slots {
            let OutputSlot {
                region,
                duplication,
                ..
            } = slot;
            duplication.read_staging(&mut |view: StagingView<'_>| {
                stitch_region(&view, region, &mut buffer)
            })?;
        }

        let token = self.locks.lock()?;
        buffer.into_bitmap(token)
    }

    fn unlock_frame_bitmap(&mut self, bitmap: BitmapData) -> CaptureResult<()> {
        self.locks.unlock(bitmap.token())
    }
}

impl Drop for DuplicationSource {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Err(err) = slot.release_lease() {
                warn!(output = %slot.region.output.output, error = %err, "failed to release frame lease");
            }
        }
        close_in_reverse(&mut self.slots);
    }
}

/// Desktop device-context copy of the whole capture rectangle.
pub(crate) struct BlitSource {
    bounds: Rectangle,
    blitter: Box<dyn DesktopBlitter>,
    locks: BitmapLocks,
    frame_ready: bool,
}

impl BlitSource {
    fn open(platform: &dyn DisplayPlatform, bounds: Rectangle) -> CaptureResult<Self> {
        Ok(Self {
            bounds,
            blitter: platform.open_blitter()?,
            locks: BitmapLocks::default(),
            frame_ready: false,
        })
    }
}

impl FrameSource for BlitSource {
    fn backend(&self) -> BackendKind {
        BackendKind::Blit
    }

    fn capture_bounds(&self) -> Rectangle {
        self.bounds
    }

    fn acquire_frame(&mut self) -> CaptureResult<()> {
        if self.locks.is_locked() {
            return Err(CaptureError::InvalidState(
                "cannot acquire a frame while its bitmap is locked".into(),
            ));
        }
        self.frame_ready = false;
        self.blitter.blit(self.bounds)?;
        self.frame_ready = true;
        Ok(())
    }

    fn release_frame(&mut self) -> CaptureResult<()> {
        self.frame_ready = false;
        Ok(())
    }

    fn lock_frame_bitmap(&mut self) -> CaptureResult<BitmapData> {
        if !self.frame_ready {
            return Err(CaptureError::InvalidState("no frame has been acquired".into()));
        }
        self.locks.ensure_unlocked()?;

        let (width, height) = (self.bounds.width, self.bounds.height);
        let mut buffer = FrameBuffer::zeroed(width, height)?;
        self.blitter.read(&mut |view: StagingView<'_>| {
            copy_rows(
                &view,
                CopyRect {
                    src_x: 0,
                    src_y: 0,
                    width,
                    height,
                    dst_x: 0,
                    dst_y: 0,
                },
                &mut buffer,
            )
        })?;

        let token = self.locks.lock()?;
        buffer.into_bitmap(token)
    }

    fn unlock_frame_bitmap(&mut self, bitmap: BitmapData) -> CaptureResult<()> {
        self.locks.unlock(bitmap.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::PixelFormat;
    use crate::platform::virtual_desktop::{DesktopEvent, ScriptedFrame, VirtualDesktop};

    fn config() -> SourceConfig {
        SourceConfig {
            acquire_timeout: Duration::from_millis(1),
            max_empty_frames: 4,
            max_acquire_timeouts: 3,
            force_blit: false,
        }
    }

    fn platform(desktop: &VirtualDesktop) -> Arc<dyn DisplayPlatform> {
        Arc::new(desktop.clone())
    }

    fn two_outputs() -> VirtualDesktop {
        VirtualDesktop::new()
            .with_output(Rectangle {
                x: 0,
                y: 0,
                width: 8,
                height: 6,
            })
            .with_output(Rectangle {
                x: 8,
                y: 2,
                width: 4,
                height: 4,
            })
    }

    fn assert_matches_desktop(desktop: &VirtualDesktop, bitmap: &BitmapData, bounds: Rectangle) {
        for y in 0..bitmap.height() {
            for x in 0..bitmap.width() {
                let expected = desktop
                    .pixel_at(bounds.x + x as i32, bounds.y + y as i32)
                    .unwrap_or_default();
                assert_eq!(bitmap.pixel(x, y), Some(expected), "pixel ({x}, {y})");
            }
        }
    }

    #[test]
    fn empty_frame_is_consumed_before_returning() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(16, 16);
        desktop.script(0, [ScriptedFrame::Empty]);
        let mut source = create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 16, 16)?, &config())?;
        desktop.clear_events();

        source.acquire_frame()?;
        assert_eq!(
            desktop.events(),
            vec![
                DesktopEvent::FrameAcquired {
                    output: 0,
                    empty: true
                },
                DesktopEvent::FrameReleased { output: 0 },
                DesktopEvent::FrameAcquired {
                    output: 0,
                    empty: false
                },
                DesktopEvent::StagingCopied { output: 0 },
                DesktopEvent::FrameReleased { output: 0 },
            ]
        );
        Ok(())
    }

    #[test]
    fn full_hd_output_maps_one_to_one() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(1920, 1080);
        let region = Rectangle::new(0, 0, 1920, 1080)?;
        let mut source = create_frame_source(&platform(&desktop), region, &config())?;
        assert_eq!(source.backend(), BackendKind::Duplication);
        assert_eq!(source.capture_bounds(), region);

        source.acquire_frame()?;
        let bitmap = source.lock_frame_bitmap()?;
        assert_eq!((bitmap.width(), bitmap.height()), (1920, 1080));
        assert_eq!(bitmap.format(), PixelFormat::Bgra8);
        for (x, y) in [(0, 0), (1919, 0), (0, 1079), (1919, 1079), (733, 512)] {
            assert_eq!(bitmap.pixel(x, y), desktop.pixel_at(x as i32, y as i32));
        }
        source.unlock_frame_bitmap(bitmap)?;
        source.release_frame()
    }

    #[test]
    fn spanning_capture_keeps_outputs_disjoint() -> CaptureResult<()> {
        let desktop = two_outputs();
        let mut source =
            create_frame_source(&platform(&desktop), Rectangle::new(6, 0, 5, 6)?, &config())?;
        source.acquire_frame()?;
        let bitmap = source.lock_frame_bitmap()?;
        assert_matches_desktop(&desktop, &bitmap, source.capture_bounds());
        // Left output's tag never lands in the right output's region.
        assert_eq!(bitmap.pixel(3, 3).map(|px| px[2]), Some(0x41));
        assert_eq!(bitmap.pixel(1, 3).map(|px| px[2]), Some(0x40));
        source.unlock_frame_bitmap(bitmap)
    }

    #[test]
    fn unsupported_duplication_falls_back_to_blit() -> CaptureResult<()> {
        let desktop = two_outputs().with_unsupported_duplication();
        let region = Rectangle::new(2, 1, 9, 4)?;
        let mut source = create_frame_source(&platform(&desktop), region, &config())?;
        assert_eq!(source.backend(), BackendKind::Blit);

        source.acquire_frame()?;
        let bitmap = source.lock_frame_bitmap()?;
        assert_matches_desktop(&desktop, &bitmap, source.capture_bounds());
        source.unlock_frame_bitmap(bitmap)
    }

    #[test]
    fn other_duplication_errors_do_not_fall_back() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(8, 8).with_failing_duplication("device removed");
        let result = create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 8, 8)?, &config());
        assert!(matches!(result, Err(CaptureError::Platform(_))));
        assert!(!desktop.events().contains(&DesktopEvent::BlitterOpened));
        Ok(())
    }

    #[test]
    fn no_backend_left_is_unavailable() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(8, 8)
            .with_unsupported_duplication()
            .without_blit();
        let result = create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 8, 8)?, &config());
        assert!(matches!(result, Err(CaptureError::BackendUnavailable(_))));
        Ok(())
    }

    #[test]
    fn forced_blit_skips_duplication() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(8, 8);
        let forced = SourceConfig {
            force_blit: true,
            ..config()
        };
        let source = create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 8, 8)?, &forced)?;
        assert_eq!(source.backend(), BackendKind::Blit);
        Ok(())
    }

    #[test]
    fn region_off_every_output_has_no_adapter() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(8, 8);
        let result =
            create_frame_source(&platform(&desktop), Rectangle::new(50, 50, 8, 8)?, &config());
        assert!(matches!(result, Err(CaptureError::NoSuitableAdapter)));
        Ok(())
    }

    #[test]
    fn duplications_close_in_reverse_order() -> CaptureResult<()> {
        let desktop = two_outputs();
        let source =
            create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 12, 6)?, &config())?;
        desktop.clear_events();
        drop(source);
        assert_eq!(
            desktop.events(),
            vec![
                DesktopEvent::DuplicationClosed { output: 1 },
                DesktopEvent::DuplicationClosed { output: 0 },
            ]
        );
        Ok(())
    }

    #[test]
    fn bitmap_locks_are_exclusive_and_token_checked() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(4, 4);
        let mut source =
            create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 4, 4)?, &config())?;
        assert!(matches!(
            source.lock_frame_bitmap(),
            Err(CaptureError::InvalidState(_))
        ));

        source.acquire_frame()?;
        let bitmap = source.lock_frame_bitmap()?;
        assert!(matches!(
            source.lock_frame_bitmap(),
            Err(CaptureError::InvalidState(_))
        ));
        assert!(matches!(
            source.acquire_frame(),
            Err(CaptureError::InvalidState(_))
        ));

        let forged = BitmapData::new(
            4,
            4,
            PixelFormat::Bgra8,
            16,
            vec![0u8; 64],
            LockToken::new(bitmap.token().value() + 100),
        )?;
        assert!(matches!(
            source.unlock_frame_bitmap(forged),
            Err(CaptureError::InvalidState(_))
        ));
        source.unlock_frame_bitmap(bitmap)?;
        source.release_frame()?;
        source.release_frame()
    }

    #[test]
    fn unchanged_desktop_keeps_staged_pixels() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(4, 4);
        let mut source =
            create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 4, 4)?, &config())?;
        source.acquire_frame()?;
        source.release_frame()?;

        desktop.script(0, [ScriptedFrame::NoNewFrame]);
        desktop.clear_events();
        source.acquire_frame()?;
        assert_eq!(desktop.events(), vec![DesktopEvent::NoNewFrame { output: 0 }]);
        let bitmap = source.lock_frame_bitmap()?;
        assert_eq!(bitmap.pixel(1, 2), desktop.pixel_at(1, 2));
        source.unlock_frame_bitmap(bitmap)
    }

    #[test]
    fn sustained_silence_times_out() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(4, 4);
        desktop.script(0, vec![ScriptedFrame::NoNewFrame; 3]);
        let mut source =
            create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 4, 4)?, &config())?;
        assert!(matches!(source.acquire_frame(), Err(CaptureError::Timeout)));
        // Timeouts are transient: the next attempt succeeds.
        source.acquire_frame()
    }

    #[test]
    fn empty_frame_retries_are_bounded() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(4, 4);
        desktop.script(0, vec![ScriptedFrame::Empty; 5]);
        let mut source =
            create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 4, 4)?, &config())?;
        assert!(matches!(source.acquire_frame(), Err(CaptureError::Timeout)));
        Ok(())
    }

    #[test]
    fn access_loss_makes_the_source_unusable() -> CaptureResult<()> {
        let desktop = VirtualDesktop::single_output(4, 4);
        desktop.script(0, [ScriptedFrame::AccessLost]);
        let mut source =
            create_frame_source(&platform(&desktop), Rectangle::new(0, 0, 4, 4)?, &config())?;
        assert!(matches!(source.acquire_frame(), Err(CaptureError::AccessLost)));
        assert!(matches!(
            source.acquire_frame(),
            Err(CaptureError::InvalidState(_))
        ));
        Ok(())
    }
}
