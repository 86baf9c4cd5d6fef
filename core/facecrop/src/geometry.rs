//! Pure geometry: box aggregation, margin clamping and output sizing.

use crate::error::FaceCropError;
use crate::face_locator::DetectionBox;

/// Crop region within the source image, in whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width, at least 1.
    pub width: u32,
    /// Height, at least 1.
    pub height: u32,
}

impl CropRegion {
    /// Region covering an entire `width` × `height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Returns `true` when the region is non-empty and lies inside the bounds.
    pub fn fits_within(&self, bounds_w: u32, bounds_h: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= bounds_w)
            && self.y.checked_add(self.height).is_some_and(|b| b <= bounds_h)
    }
}

/// Output size of the scaled image. Both sides are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDimensions {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
}

/// Smallest box containing every box in `boxes`, or `None` when empty.
///
/// The merged confidence is the highest input confidence.
pub fn union_box(boxes: &[DetectionBox]) -> Option<DetectionBox> {
    let (first, rest) = boxes.split_first()?;

    let mut min_x = first.x;
    let mut min_y = first.y;
    let mut max_x = first.right();
    let mut max_y = first.bottom();
    let mut confidence = first.confidence;

    for b in rest {
        min_x = min_x.min(b.x);
        min_y = min_y.min(b.y);
        max_x = max_x.max(b.right());
        max_y = max_y.max(b.bottom());
        confidence = confidence.max(b.confidence);
    }

    Some(DetectionBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x,
        height: max_y - min_y,
        confidence,
    })
}

/// Grow `bbox` by `margin` pixels on every side and clamp it to the image.
///
/// Fractional edges snap outward to whole pixels. A region that collapses to
/// zero width or height fails with [`FaceCropError::DegenerateRegion`].
pub fn expand_and_clamp(
    bbox: &DetectionBox,
    margin: u32,
    bounds_w: u32,
    bounds_h: u32,
) -> Result<CropRegion, FaceCropError> {
    let margin = f64::from(margin);
    let (max_w, max_h) = (f64::from(bounds_w), f64::from(bounds_h));

    let left = (bbox.x - margin).floor().clamp(0.0, max_w);
    let top = (bbox.y - margin).floor().clamp(0.0, max_h);
    let right = (bbox.right() + margin).ceil().clamp(0.0, max_w);
    let bottom = (bbox.bottom() + margin).ceil().clamp(0.0, max_h);

    let width = (right - left).max(0.0) as u32;
    let height = (bottom - top).max(0.0) as u32;

    if width == 0 || height == 0 {
        return Err(FaceCropError::DegenerateRegion { width, height });
    }

    Ok(CropRegion {
        x: left as u32,
        y: top as u32,
        width,
        height,
    })
}

/// Compute the output size for a `source_w` × `source_h` region.
///
/// Without `preserve_aspect` the requested size is used verbatim. With it, the
/// side matching the longer source side is pinned to its requested value and
/// the other follows the source aspect ratio; square sources pin the height.
pub fn compute_scaled_size(
    source_w: u32,
    source_h: u32,
    target_w: u32,
    target_h: u32,
    preserve_aspect: bool,
) -> TargetDimensions {
    if !preserve_aspect {
        return TargetDimensions {
            width: target_w.max(1),
            height: target_h.max(1),
        };
    }

    let aspect = f64::from(source_w) / f64::from(source_h.max(1));
    let (width, height) = if source_w > source_h {
        (target_w, rounded_side(f64::from(target_w) / aspect))
    } else {
        (rounded_side(f64::from(target_h) * aspect), target_h)
    };

    TargetDimensions {
        width: width.max(1),
        height: height.max(1),
    }
}

fn rounded_side(value: f64) -> u32 {
    if value.is_finite() {
        value.round().clamp(1.0, f64::from(u32::MAX)) as u32
    } else {
        1
    }
}
