//! 坐标系与坐标变换
//!
//! Three coordinate spaces meet in the capture core:
//! - analysis-frame space: upright, sized by the rotation-corrected frame dims
//! - bitmap space: the full-resolution capture bitmap, raw sensor orientation
//! - view space: the preview widget's pixels (see `overlay`)
//!
//! `transform_to_bitmap` maps analysis-frame boxes into bitmap space.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle with float edges.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RectF {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    /// Finite edges and strictly positive extent.
    pub fn is_valid(&self) -> bool {
        [self.left, self.top, self.right, self.bottom]
            .iter()
            .all(|v| v.is_finite())
            && self.width() > 0.0
            && self.height() > 0.0
    }

    /// True when the rectangle overlaps `[0, width] x [0, height]` with positive area.
    pub fn intersects_bounds(&self, width: f32, height: f32) -> bool {
        self.left < width && self.right > 0.0 && self.top < height && self.bottom > 0.0
    }

    pub fn clamp_to(&self, width: f32, height: f32) -> RectF {
        RectF {
            left: self.left.clamp(0.0, width),
            top: self.top.clamp(0.0, height),
            right: self.right.clamp(0.0, width),
            bottom: self.bottom.clamp(0.0, height),
        }
    }

    /// Grow each side by `fraction` of the rectangle's own extent on that axis.
    pub fn expand(&self, fraction: f32) -> RectF {
        let pad_x = self.width() * fraction;
        let pad_y = self.height() * fraction;
        RectF {
            left: self.left - pad_x,
            top: self.top - pad_y,
            right: self.right + pad_x,
            bottom: self.bottom + pad_y,
        }
    }

    pub fn intersection_over_union(&self, other: &RectF) -> f32 {
        let inter = RectF {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        }
        .area();
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Integer pixel region inside a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Outer integer rectangle of an already-clamped float rectangle.
    pub fn enclosing(rect: &RectF, max_width: u32, max_height: u32) -> Self {
        let x0 = (rect.left.floor().max(0.0) as u32).min(max_width);
        let y0 = (rect.top.floor().max(0.0) as u32).min(max_height);
        let x1 = (rect.right.ceil().max(0.0) as u32).min(max_width);
        let y1 = (rect.bottom.ceil().max(0.0) as u32).min(max_height);
        Self {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0),
            height: y1.saturating_sub(y0),
        }
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Device rotation hint delivered with every camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// Upright dimensions for a frame reported as `width x height` by the sensor.
    pub fn corrected_dims(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }
}

/// Share of the frame covered by `rect`, in percent (0..=100).
pub fn area_percentage(rect: &RectF, frame_width: u32, frame_height: u32) -> f32 {
    let frame_area = frame_width as f32 * frame_height as f32;
    if frame_area <= 0.0 {
        return 0.0;
    }
    rect.area() / frame_area * 100.0
}

/// Map a box from analysis-frame space into bitmap space.
///
/// `frame_width`/`frame_height` are the rotation-corrected frame dims the box
/// was detected against. The bitmap stays in raw sensor orientation, so for
/// 90/270 the axes are swapped before scaling. Every output edge is clamped
/// into the bitmap.
pub fn transform_to_bitmap(
    rect: &RectF,
    frame_width: u32,
    frame_height: u32,
    bitmap_width: u32,
    bitmap_height: u32,
    rotation: Rotation,
) -> RectF {
    if frame_width == bitmap_width && frame_height == bitmap_height {
        return *rect;
    }
    if frame_width == 0 || frame_height == 0 {
        return RectF::default();
    }

    let fw = frame_width as f32;
    let fh = frame_height as f32;
    let bw = bitmap_width as f32;
    let bh = bitmap_height as f32;

    let mapped = match rotation {
        Rotation::Deg90 => {
            let scale_x = bw / fh;
            let scale_y = bh / fw;
            RectF {
                left: rect.top * scale_y,
                top: bh - rect.right * scale_x,
                right: rect.bottom * scale_y,
                bottom: bh - rect.left * scale_x,
            }
        }
        Rotation::Deg270 => {
            let scale_x = bw / fh;
            let scale_y = bh / fw;
            RectF {
                left: bw - rect.bottom * scale_y,
                top: rect.left * scale_x,
                right: bw - rect.top * scale_y,
                bottom: rect.right * scale_x,
            }
        }
        Rotation::Deg0 | Rotation::Deg180 => {
            let scale_x = bw / fw;
            let scale_y = bh / fh;
            RectF {
                left: rect.left * scale_x,
                top: rect.top * scale_y,
                right: rect.right * scale_x,
                bottom: rect.bottom * scale_y,
            }
        }
    };

    mapped.clamp_to(bw, bh)
}

/// Inverse of [`transform_to_bitmap`] for boxes that were not clamped.
pub fn transform_from_bitmap(
    rect: &RectF,
    frame_width: u32,
    frame_height: u32,
    bitmap_width: u32,
    bitmap_height: u32,
    rotation: Rotation,
) -> RectF {
    if frame_width == bitmap_width && frame_height == bitmap_height {
        return *rect;
    }
    if bitmap_width == 0 || bitmap_height == 0 || frame_width == 0 || frame_height == 0 {
        return RectF::default();
    }

    let fw = frame_width as f32;
    let fh = frame_height as f32;
    let bw = bitmap_width as f32;
    let bh = bitmap_height as f32;

    match rotation {
        Rotation::Deg90 => {
            let scale_x = bw / fh;
            let scale_y = bh / fw;
            RectF {
                left: (bh - rect.bottom) / scale_x,
                top: rect.left / scale_y,
                right: (bh - rect.top) / scale_x,
                bottom: rect.right / scale_y,
            }
        }
        Rotation::Deg270 => {
            let scale_x = bw / fh;
            let scale_y = bh / fw;
            RectF {
                left: rect.top / scale_x,
                top: (bw - rect.right) / scale_y,
                right: rect.bottom / scale_x,
                bottom: (bw - rect.left) / scale_y,
            }
        }
        Rotation::Deg0 | Rotation::Deg180 => {
            let scale_x = bw / fw;
            let scale_y = bh / fh;
            RectF {
                left: rect.left / scale_x,
                top: rect.top / scale_y,
                right: rect.right / scale_x,
                bottom: rect.bottom / scale_y,
            }
        }
    }
}
