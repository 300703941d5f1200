//! Virtual-desktop geometry.
//!
//! [`DesktopLayout`] snapshots the enumerated outputs once per frame
//! source. [`Rectangle`] describes an arbitrary rectangle in virtual
//! desktop coordinates that may span several outputs.

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, CaptureResult};
use crate::output::OutputId;

/// A rectangle in virtual desktop coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> CaptureResult<Self> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidRegion(
                "region width and height must be > 0".into(),
            ));
        }
        if i32::try_from(width).is_err() || i32::try_from(height).is_err() {
            return Err(CaptureError::InvalidRegion(format!(
                "region size {width}x{height} exceeds the virtual desktop range"
            )));
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Right edge (exclusive) in virtual desktop coordinates.
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width as i32)
    }

    /// Bottom edge (exclusive) in virtual desktop coordinates.
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, other: &Rectangle) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    /// Overlapping area of two rectangles, or `None` when they only touch
    /// or do not meet at all.
    pub fn intersect(&self, other: &Rectangle) -> Option<Rectangle> {
        let ix = self.x.max(other.x);
        let iy = self.y.max(other.y);
        let ix2 = self.right().min(other.right());
        let iy2 = self.bottom().min(other.bottom());

        if ix < ix2 && iy < iy2 {
            Some(Rectangle {
                x: ix,
                y: iy,
                width: (ix2 - ix) as u32,
                height: (iy2 - iy) as u32,
            })
        } else {
            None
        }
    }

    /// Smallest rectangle covering every input rectangle.
    pub fn union_of<'a, I>(rects: I) -> Option<Rectangle>
    where
        I: IntoIterator<Item = &'a Rectangle>,
    {
        let mut left = i32::MAX;
        let mut top = i32::MAX;
        let mut right = i32::MIN;
        let mut bottom = i32::MIN;
        let mut any = false;
        for rect in rects {
            any = true;
            left = left.min(rect.x);
            top = top.min(rect.y);
            right = right.max(rect.right());
            bottom = bottom.max(rect.bottom());
        }
        if !any || left >= right || top >= bottom {
            return None;
        }
        Some(Rectangle {
            x: left,
            y: top,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }

    /// Express this rectangle relative to `origin`'s top-left corner.
    pub fn relative_to(&self, origin: &Rectangle) -> Rectangle {
        Rectangle {
            x: self.x - origin.x,
            y: self.y - origin.y,
            width: self.width,
            height: self.height,
        }
    }
}

/// Geometry of a single output in the virtual desktop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputGeometry {
    pub output: OutputId,
    pub bounds: Rectangle,
}

/// A snapshot of the virtual desktop output layout. Used to determine
/// which outputs overlap a capture rectangle and where each one lands in
/// the stitched frame.
#[derive(Clone, Debug)]
pub struct DesktopLayout {
    pub outputs: Vec<OutputGeometry>,
}

impl DesktopLayout {
    pub fn new(outputs: Vec<OutputGeometry>) -> CaptureResult<Self> {
        if outputs.is_empty() {
            return Err(CaptureError::NoSuitableAdapter);
        }
        Ok(Self { outputs })
    }

    /// Bounding box of the entire virtual desktop.
    pub fn virtual_bounds(&self) -> Option<Rectangle> {
        Rectangle::union_of(self.outputs.iter().map(|geometry| &geometry.bounds))
    }

    pub fn primary(&self) -> Option<&OutputGeometry> {
        self.outputs
            .iter()
            .find(|geometry| geometry.output.is_primary())
            .or_else(|| self.outputs.first())
    }

    pub fn find(&self, output: &OutputId) -> Option<&OutputGeometry> {
        self.outputs
            .iter()
            .find(|geometry| geometry.output.key() == output.key())
    }

    /// Return the outputs that overlap the given region, along with the
    /// intersection rectangle in virtual desktop coordinates.
    pub fn overlapping_outputs(&self, region: &Rectangle) -> Vec<(OutputGeometry, Rectangle)> {
        self.outputs
            .iter()
            .filter_map(|geometry| {
                region
                    .intersect(&geometry.bounds)
                    .map(|intersection| (geometry.clone(), intersection))
            })
            .collect()
    }
}

/// The region kinds a capture request can name. Everything other than
/// `Fixed` is resolved against the output layout when the frame source is
/// built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionSelector {
    Fixed(Rectangle),
    /// One whole output, matched by its stable id.
    Output { stable_id: String },
    /// The primary output.
    PrimaryOutput,
    /// The bounding box of every output.
    AllOutputs,
}

impl RegionSelector {
    pub fn resolve(&self, layout: &DesktopLayout) -> CaptureResult<Rectangle> {
        match self {
            Self::Fixed(rect) => Rectangle::new(rect.x, rect.y, rect.width, rect.height),
            Self::Output { stable_id } => layout
                .outputs
                .iter()
                .find(|geometry| geometry.output.stable_id() == *stable_id)
                .map(|geometry| geometry.bounds)
                .ok_or_else(|| {
                    CaptureError::InvalidRegion(format!("output {stable_id} is not attached"))
                }),
            Self::PrimaryOutput => layout
                .primary()
                .map(|geometry| geometry.bounds)
                .ok_or(CaptureError::NoSuitableAdapter),
            Self::AllOutputs => layout.virtual_bounds().ok_or(CaptureError::NoSuitableAdapter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(index: u32, x: i32, y: i32, width: u32, height: u32) -> OutputGeometry {
        OutputGeometry {
            output: OutputId::new(0, index, 7, format!("out-{index}"), index == 0),
            bounds: Rectangle {
                x,
                y,
                width,
                height,
            },
        }
    }

    fn side_by_side() -> DesktopLayout {
        DesktopLayout {
            outputs: vec![geometry(0, 0, 0, 1920, 1080), geometry(1, 1920, 0, 1280, 1024)],
        }
    }

    #[test]
    fn rejects_empty_rectangles() {
        assert!(Rectangle::new(0, 0, 0, 10).is_err());
        assert!(Rectangle::new(0, 0, 10, 0).is_err());
        assert!(Rectangle::new(0, 0, u32::MAX, 10).is_err());
    }

    #[test]
    fn touching_rectangles_do_not_intersect() -> CaptureResult<()> {
        let a = Rectangle::new(0, 0, 100, 100)?;
        let b = Rectangle::new(100, 0, 100, 100)?;
        assert_eq!(a.intersect(&b), None);
        let c = Rectangle::new(50, 50, 100, 100)?;
        assert_eq!(a.intersect(&c), Some(Rectangle::new(50, 50, 50, 50)?));
        Ok(())
    }

    #[test]
    fn spanning_region_hits_both_outputs() -> CaptureResult<()> {
        let layout = side_by_side();
        let region = Rectangle::new(1800, 100, 300, 200)?;
        let hits = layout.overlapping_outputs(&region);

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1, Rectangle::new(1800, 100, 120, 200)?);
        assert_eq!(hits[1].1, Rectangle::new(1920, 100, 180, 200)?);
        Ok(())
    }

    #[test]
    fn region_outside_desktop_hits_nothing() -> CaptureResult<()> {
        let layout = side_by_side();
        let region = Rectangle::new(-500, -500, 100, 100)?;
        assert!(layout.overlapping_outputs(&region).is_empty());
        Ok(())
    }

    #[test]
    fn selectors_resolve_against_layout() -> CaptureResult<()> {
        let layout = side_by_side();
        assert_eq!(
            RegionSelector::AllOutputs.resolve(&layout)?,
            Rectangle::new(0, 0, 3200, 1080)?
        );
        assert_eq!(
            RegionSelector::PrimaryOutput.resolve(&layout)?,
            Rectangle::new(0, 0, 1920, 1080)?
        );

        let second = layout.outputs[1].output.stable_id();
        assert_eq!(
            RegionSelector::Output { stable_id: second }.resolve(&layout)?,
            Rectangle::new(1920, 0, 1280, 1024)?
        );
        assert!(
            RegionSelector::Output {
                stable_id: "missing".into()
            }
            .resolve(&layout)
            .is_err()
        );
        Ok(())
    }

    #[test]
    fn selector_round_trips_through_json() -> CaptureResult<()> {
        let selector = RegionSelector::Fixed(Rectangle::new(-10, 20, 30, 40)?);
        let json = serde_json::to_value(&selector)
            .map_err(|e| CaptureError::InvalidConfig(e.to_string()))?;
        assert_eq!(json["kind"], "fixed");
        let back: RegionSelector = serde_json::from_value(json)
            .map_err(|e| CaptureError::InvalidConfig(e.to_string()))?;
        assert_eq!(back, selector);
        Ok(())
    }
}
