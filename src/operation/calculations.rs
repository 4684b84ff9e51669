//! Pure dimension math used by operations.
//!
//! Everything here is a pure function over pixel dimensions, testable
//! without any I/O or images.

use super::Dimensions;

/// Tolerance for float comparisons of factors and angles.
pub(crate) const DELTA: f32 = 0.000_01;

/// An axis-aligned region within an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub fn size(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Whether the rectangle covers all of `full`.
    pub fn covers(&self, full: Dimensions) -> bool {
        self.x == 0 && self.y == 0 && self.width >= full.width && self.height >= full.height
    }
}

/// Multiply a length by a factor, rounding to the nearest pixel.
///
/// Never returns zero for a non-zero input; a sub-pixel result still
/// occupies one pixel.
pub fn scale_length(length: u32, factor: f64) -> u32 {
    let scaled = (length as f64 * factor).round() as u32;
    if length > 0 { scaled.max(1) } else { 0 }
}

/// Clip a pixel rectangle to the image bounds.
///
/// # Examples
/// ```
/// # use image_derivatives::operation::{Dimensions, calculations::clip_rectangle};
/// // A 50x50 region starting at (80, 10) on a 100x100 image keeps 20x50
/// let r = clip_rectangle(Dimensions::new(100, 100), 80, 10, 50, 50);
/// assert_eq!((r.x, r.y, r.width, r.height), (80, 10, 20, 50));
/// ```
pub fn clip_rectangle(full: Dimensions, x: u32, y: u32, width: u32, height: u32) -> Rectangle {
    let x = x.min(full.width);
    let y = y.min(full.height);
    Rectangle {
        x,
        y,
        width: width.min(full.width - x),
        height: height.min(full.height - y),
    }
}

/// Convert fractional (0–1) crop coordinates into a pixel rectangle.
pub fn percent_rectangle(full: Dimensions, x: f32, y: f32, width: f32, height: f32) -> Rectangle {
    let px = |len: u32, frac: f32| (len as f64 * frac.clamp(0.0, 1.0) as f64).round() as u32;
    clip_rectangle(
        full,
        px(full.width, x),
        px(full.height, y),
        px(full.width, width),
        px(full.height, height),
    )
}

/// Largest centered square that fits inside the image.
pub fn square_rectangle(full: Dimensions) -> Rectangle {
    let edge = full.width.min(full.height);
    Rectangle {
        x: (full.width - edge) / 2,
        y: (full.height - edge) / 2,
        width: edge,
        height: edge,
    }
}

/// Dimensions after scaling to an exact width, preserving aspect ratio.
pub fn fit_width(source: Dimensions, width: u32) -> Dimensions {
    if source.width == 0 {
        return source;
    }
    let factor = width as f64 / source.width as f64;
    Dimensions::new(width, scale_length(source.height, factor))
}

/// Dimensions after scaling to an exact height, preserving aspect ratio.
pub fn fit_height(source: Dimensions, height: u32) -> Dimensions {
    if source.height == 0 {
        return source;
    }
    let factor = height as f64 / source.height as f64;
    Dimensions::new(scale_length(source.width, factor), height)
}

/// Largest dimensions that fit inside `bounds` while preserving aspect ratio.
///
/// One edge matches its bound exactly; the other is at most its bound.
pub fn fit_inside(source: Dimensions, bounds: Dimensions) -> Dimensions {
    if source.width == 0 || source.height == 0 {
        return source;
    }
    let wf = bounds.width as f64 / source.width as f64;
    let hf = bounds.height as f64 / source.height as f64;
    if wf <= hf {
        Dimensions::new(bounds.width, scale_length(source.height, wf))
    } else {
        Dimensions::new(scale_length(source.width, hf), bounds.height)
    }
}
