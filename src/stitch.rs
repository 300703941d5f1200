//! Mapping a virtual-desktop rectangle onto per-output staging buffers
//! and re-assembling them into one contiguous bitmap.
//!
//! A [`StitchPlan`] is computed once when a frame source is built. Its
//! regions are indexed in parallel with the source's duplication handles;
//! stitching itself is a pure per-region copy into the destination.

use crate::backend::StagingView;
use crate::bitmap::FrameBuffer;
use crate::error::{CaptureError, CaptureResult};
use crate::region::{DesktopLayout, OutputGeometry, Rectangle};

/// One output's share of a capture rectangle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StitchRegion {
    pub output: OutputGeometry,
    /// Overlap of the capture rectangle and the output, in desktop
    /// coordinates.
    pub intersection: Rectangle,
    /// The same overlap relative to the output's top-left corner. This is
    /// what gets copied into the output's staging buffer.
    pub local: Rectangle,
    /// Where the staged pixels land in the stitched bitmap.
    pub dst_x: u32,
    pub dst_y: u32,
}

#[derive(Clone, Debug)]
pub struct StitchPlan {
    bounds: Rectangle,
    regions: Vec<StitchRegion>,
}

impl StitchPlan {
    pub fn new(layout: &DesktopLayout, region: Rectangle) -> CaptureResult<Self> {
        let overlaps = layout.overlapping_outputs(&region);
        let bounds = Rectangle::union_of(overlaps.iter().map(|(_, intersection)| intersection))
            .ok_or(CaptureError::NoSuitableAdapter)?;

        // bounds.x/y are the minimum X/Y over all intersections.
        let regions = overlaps
            .into_iter()
            .map(|(output, intersection)| StitchRegion {
                local: intersection.relative_to(&output.bounds),
                dst_x: (intersection.x - bounds.x) as u32,
                dst_y: (intersection.y - bounds.y) as u32,
                output,
                intersection,
            })
            .collect();

        Ok(Self { bounds, regions })
    }

    /// The stitched bitmap's rectangle: the union of every intersection.
    pub fn bounds(&self) -> Rectangle {
        self.bounds
    }

    pub fn regions(&self) -> &[StitchRegion] {
        &self.regions
    }

    #[cfg(test)]
    pub(crate) fn is_single_region(&self) -> bool {
        self.regions.len() == 1
    }
}

/// Source/destination rectangle pair for a row copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CopyRect {
    pub src_x: u32,
    pub src_y: u32,
    pub width: u32,
    pub height: u32,
    pub dst_x: u32,
    pub dst_y: u32,
}

/// Copy one region's staged pixels to its offset in the destination.
pub fn stitch_region(
    staging: &StagingView<'_>,
    region: &StitchRegion,
    destination: &mut FrameBuffer,
) -> CaptureResult<()> {
    copy_rows(
        staging,
        CopyRect {
            src_x: 0,
            src_y: 0,
            width: region.local.width,
            height: region.local.height,
            dst_x: region.dst_x,
            dst_y: region.dst_y,
        },
        destination,
    )
}

/// Scanline copy. Source and destination strides generally differ, so a
/// single bulk copy would shear rows.
pub(crate) fn copy_rows(
    src: &StagingView<'_>,
    rect: CopyRect,
    dst: &mut FrameBuffer,
) -> CaptureResult<()> {
    if rect.width == 0 || rect.height == 0 {
        return Ok(());
    }

    let src_w = src.width as usize;
    let src_h = src.height as usize;
    let dst_w = dst.width() as usize;
    let dst_h = dst.height() as usize;

    let src_x = rect.src_x as usize;
    let src_y = rect.src_y as usize;
    let dst_x = rect.dst_x as usize;
    let dst_y = rect.dst_y as usize;
    let copy_w = rect.width as usize;
    let copy_h = rect.height as usize;

    let src_right = src_x
        .checked_add(copy_w)
        .ok_or(CaptureError::BufferOverflow)?;
    let src_bottom = src_y
        .checked_add(copy_h)
        .ok_or(CaptureError::BufferOverflow)?;
    let dst_right = dst_x
        .checked_add(copy_w)
        .ok_or(CaptureError::BufferOverflow)?;
    let dst_bottom = dst_y
        .checked_add(copy_h)
        .ok_or(CaptureError::BufferOverflow)?;

    if src_right > src_w || src_bottom > src_h || dst_right > dst_w || dst_bottom > dst_h {
        return Err(CaptureError::BufferOverflow);
    }

    let src_stride = src.stride;
    let dst_stride = dst.stride();
    let row_bytes = copy_w.checked_mul(4).ok_or(CaptureError::BufferOverflow)?;
    let src_min_stride = src_w.checked_mul(4).ok_or(CaptureError::BufferOverflow)?;
    if src_stride < src_min_stride {
        return Err(CaptureError::BufferOverflow);
    }

    let src_start = src_y
        .checked_mul(src_stride)
        .and_then(|off| src_x.checked_mul(4).and_then(|xoff| off.checked_add(xoff)))
        .ok_or(CaptureError::BufferOverflow)?;
    let dst_start = dst_y
        .checked_mul(dst_stride)
        .and_then(|off| dst_x.checked_mul(4).and_then(|xoff| off.checked_add(xoff)))
        .ok_or(CaptureError::BufferOverflow)?;

    let src_bytes = src.bytes;
    let dst_bytes = dst.as_mut_bytes();

    let mut src_row_start = src_start;
    let mut dst_row_start = dst_start;
    for _ in 0..copy_h {
        let src_row_end = src_row_start
            .checked_add(row_bytes)
            .ok_or(CaptureError::BufferOverflow)?;
        let dst_row_end = dst_row_start
            .checked_add(row_bytes)
            .ok_or(CaptureError::BufferOverflow)?;
        let src_row = src_bytes
            .get(src_row_start..src_row_end)
            .ok_or(CaptureError::BufferOverflow)?;
        let dst_row = dst_bytes
            .get_mut(dst_row_start..dst_row_end)
            .ok_or(CaptureError::BufferOverflow)?;
        dst_row.copy_from_slice(src_row);

        src_row_start = src_row_start
            .checked_add(src_stride)
            .ok_or(CaptureError::BufferOverflow)?;
        dst_row_start = dst_row_start
            .checked_add(dst_stride)
            .ok_or(CaptureError::BufferOverflow)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputId;

    fn layout() -> DesktopLayout {
        DesktopLayout {
            outputs: vec![
                OutputGeometry {
                    output: OutputId::new(0, 0, 1, "left", true),
                    bounds: Rectangle {
                        x: 0,
                        y: 0,
                        width: 8,
                        height: 6,
                    },
                },
                OutputGeometry {
                    output: OutputId::new(1, 0, 2, "right", false),
                    bounds: Rectangle {
                        x: 8,
                        y: 2,
                        width: 4,
                        height: 4,
                    },
                },
            ],
        }
    }

    /// Staging bytes where every pixel is `[tag, x, y, 0xFF]` with a padded
    /// stride.
    fn staging(tag: u8, width: u32, height: u32, stride: usize) -> Vec<u8> {
        let mut bytes = vec![0xCD; stride * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let at = y * stride + x * 4;
                bytes[at..at + 4].copy_from_slice(&[tag, x as u8, y as u8, 0xFF]);
            }
        }
        bytes
    }

    fn pixel(buffer: &mut FrameBuffer, x: usize, y: usize) -> [u8; 4] {
        let stride = buffer.stride();
        let at = y * stride + x * 4;
        let bytes = buffer.as_mut_bytes();
        [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
    }

    #[test]
    fn region_inside_one_output_has_zero_offset() -> CaptureResult<()> {
        let plan = StitchPlan::new(&layout(), Rectangle::new(1, 1, 4, 3)?)?;
        assert!(plan.is_single_region());
        let region = &plan.regions()[0];
        assert_eq!((region.dst_x, region.dst_y), (0, 0));
        assert_eq!(region.local, Rectangle::new(1, 1, 4, 3)?);

        let bytes = staging(1, 4, 3, 4 * 4 + 8);
        let view = StagingView {
            width: 4,
            height: 3,
            stride: 24,
            bytes: &bytes,
        };
        let mut buffer = FrameBuffer::zeroed(4, 3)?;
        stitch_region(&view, region, &mut buffer)?;
        for y in 0..3 {
            for x in 0..4 {
                assert_eq!(pixel(&mut buffer, x, y), [1, x as u8, y as u8, 0xFF]);
            }
        }
        Ok(())
    }

    #[test]
    fn spanning_region_places_outputs_side_by_side() -> CaptureResult<()> {
        let plan = StitchPlan::new(&layout(), Rectangle::new(6, 0, 5, 6)?)?;
        assert_eq!(plan.bounds(), Rectangle::new(6, 0, 5, 6)?);
        let regions = plan.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].dst_x, regions[0].dst_y), (0, 0));
        assert_eq!(regions[0].local, Rectangle::new(6, 0, 2, 6)?);
        assert_eq!((regions[1].dst_x, regions[1].dst_y), (2, 2));
        assert_eq!(regions[1].local, Rectangle::new(0, 0, 3, 4)?);

        let mut buffer = FrameBuffer::zeroed(5, 6)?;
        let left = staging(1, 2, 6, 16);
        let right = staging(2, 3, 4, 12);
        stitch_region(
            &StagingView {
                width: 2,
                height: 6,
                stride: 16,
                bytes: &left,
            },
            &regions[0],
            &mut buffer,
        )?;
        stitch_region(
            &StagingView {
                width: 3,
                height: 4,
                stride: 12,
                bytes: &right,
            },
            &regions[1],
            &mut buffer,
        )?;

        for y in 0..6 {
            for x in 0..5 {
                let px = pixel(&mut buffer, x, y);
                if x < 2 {
                    assert_eq!(px, [1, x as u8, y as u8, 0xFF]);
                } else if y >= 2 {
                    assert_eq!(px, [2, (x - 2) as u8, (y - 2) as u8, 0xFF]);
                } else {
                    // Not covered by any output.
                    assert_eq!(px, [0, 0, 0, 0]);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn region_off_the_desktop_has_no_adapter() -> CaptureResult<()> {
        let result = StitchPlan::new(&layout(), Rectangle::new(100, 100, 4, 4)?);
        assert!(matches!(result, Err(CaptureError::NoSuitableAdapter)));
        Ok(())
    }

    #[test]
    fn undersized_staging_is_rejected() -> CaptureResult<()> {
        let plan = StitchPlan::new(&layout(), Rectangle::new(0, 0, 4, 4)?)?;
        let bytes = staging(1, 2, 2, 8);
        let view = StagingView {
            width: 2,
            height: 2,
            stride: 8,
            bytes: &bytes,
        };
        let mut buffer = FrameBuffer::zeroed(4, 4)?;
        let result = stitch_region(&view, &plan.regions()[0], &mut buffer);
        assert!(matches!(result, Err(CaptureError::BufferOverflow)));
        Ok(())
    }
}
