//! Parameter types for each operation kind.
//!
//! These types describe *what* a transformation step asks for. Each one
//! knows three things about itself:
//!
//! - whether it would change the output at all (`has_effect`, plus a
//!   size-aware refinement `has_effect_at`),
//! - how it projects dimensions (`resulting_size`),
//! - a stable textual encoding of its effective parameters
//!   (`canonical_fragment`), used in cache keys and display strings.
//!
//! Pixel work lives in [`processor`](crate::processor); nothing here touches
//! image data.

use super::Dimensions;
use super::calculations::{
    DELTA, Rectangle, clip_rectangle, fit_height, fit_inside, fit_width, percent_rectangle,
    scale_length, square_rectangle,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Crop
// =============================================================================

/// Region selection.
///
/// Percent coordinates are fractions in `0.0..=1.0` of the full image.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crop {
    /// The whole image.
    #[default]
    Full,
    /// Largest centered square.
    Square,
    Pixels {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Percent {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
}

impl Crop {
    pub fn has_effect(&self) -> bool {
        match *self {
            Crop::Full => false,
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => !(x.abs() < DELTA && y.abs() < DELTA && width >= 1.0 - DELTA && height >= 1.0 - DELTA),
            Crop::Square | Crop::Pixels { .. } => true,
        }
    }

    pub fn has_effect_at(&self, full: Dimensions) -> bool {
        self.has_effect() && !self.rectangle(full).covers(full)
    }

    /// The region this crop selects from an image of size `full`.
    pub fn rectangle(&self, full: Dimensions) -> Rectangle {
        match *self {
            Crop::Full => clip_rectangle(full, 0, 0, full.width, full.height),
            Crop::Square => square_rectangle(full),
            Crop::Pixels {
                x,
                y,
                width,
                height,
            } => clip_rectangle(full, x, y, width, height),
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => percent_rectangle(full, x, y, width, height),
        }
    }

    pub fn resulting_size(&self, input: Dimensions) -> Dimensions {
        self.rectangle(input).size()
    }

    pub fn canonical_fragment(&self) -> String {
        match *self {
            Crop::Full => "full".to_string(),
            Crop::Square => "square".to_string(),
            Crop::Pixels {
                x,
                y,
                width,
                height,
            } => format!("{x},{y},{width},{height}"),
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => format!("pct:{x},{y},{width},{height}"),
        }
    }
}

// =============================================================================
// Scale
// =============================================================================

/// Resize request.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    /// Leave the size alone.
    #[default]
    Full,
    /// Multiply both edges by a factor (`0.5` = half size).
    Percent(f32),
    /// Exact width, height follows the aspect ratio.
    FitWidth(u32),
    /// Exact height, width follows the aspect ratio.
    FitHeight(u32),
    /// Largest size inside the box, aspect ratio preserved.
    FitInside { width: u32, height: u32 },
    /// Exact size, aspect ratio ignored.
    Fill { width: u32, height: u32 },
}

impl Scale {
    pub fn has_effect(&self) -> bool {
        match *self {
            Scale::Full => false,
            Scale::Percent(p) => (p - 1.0).abs() > DELTA,
            _ => true,
        }
    }

    pub fn has_effect_at(&self, full: Dimensions) -> bool {
        self.has_effect() && self.resulting_size(full) != full
    }

    pub fn resulting_size(&self, input: Dimensions) -> Dimensions {
        match *self {
            Scale::Full => input,
            Scale::Percent(p) => Dimensions::new(
                scale_length(input.width, p as f64),
                scale_length(input.height, p as f64),
            ),
            Scale::FitWidth(width) => fit_width(input, width),
            Scale::FitHeight(height) => fit_height(input, height),
            Scale::FitInside { width, height } => fit_inside(input, Dimensions::new(width, height)),
            Scale::Fill { width, height } => Dimensions::new(width, height),
        }
    }

    pub fn canonical_fragment(&self) -> String {
        match *self {
            Scale::Full => "full".to_string(),
            Scale::Percent(p) => format!("{}%", trim_decimal(p as f64 * 100.0)),
            Scale::FitWidth(w) => format!("{w},"),
            Scale::FitHeight(h) => format!(",{h}"),
            Scale::FitInside { width, height } => format!("!{width},{height}"),
            Scale::Fill { width, height } => format!("{width},{height}"),
        }
    }
}

/// Format with at most four decimals, dropping trailing zeros.
fn trim_decimal(value: f64) -> String {
    let s = format!("{value:.4}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

// =============================================================================
// Rotate
// =============================================================================

/// Clockwise rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rotate {
    pub degrees: f32,
}

impl Rotate {
    pub fn new(degrees: f32) -> Self {
        Self { degrees }
    }

    /// Rotation normalized into `0.0..360.0`.
    pub fn normalized(&self) -> f32 {
        self.degrees.rem_euclid(360.0)
    }

    pub fn has_effect(&self) -> bool {
        let d = self.normalized();
        d > DELTA && (360.0 - d) > DELTA
    }

    pub fn canonical_fragment(&self) -> String {
        format!("{}", self.normalized())
    }
}

// =============================================================================
// Transpose, Color, Sharpen
// =============================================================================

/// Mirror across an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transpose {
    Horizontal,
    Vertical,
}

impl Transpose {
    pub fn canonical_fragment(&self) -> String {
        match self {
            Transpose::Horizontal => "h",
            Transpose::Vertical => "v",
        }
        .to_string()
    }
}

/// Color space conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Gray,
    Bitonal,
}

impl Color {
    pub fn canonical_fragment(&self) -> String {
        match self {
            Color::Gray => "gray",
            Color::Bitonal => "bitonal",
        }
        .to_string()
    }
}

/// Unsharp-mask strength (Gaussian sigma). Zero means no sharpening.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sharpen {
    pub amount: f32,
}

impl Sharpen {
    pub fn new(amount: f32) -> Self {
        Self { amount }
    }

    pub fn has_effect(&self) -> bool {
        self.amount > DELTA
    }

    pub fn canonical_fragment(&self) -> String {
        format!("{}", self.amount)
    }
}

// =============================================================================
// Overlay
// =============================================================================

/// What an overlay draws.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayContent {
    Text(String),
    /// URI or path of the overlay image.
    Image(String),
}

/// Anchor of an overlay within the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    TopLeft,
    TopCenter,
    TopRight,
    LeftCenter,
    Center,
    RightCenter,
    BottomLeft,
    BottomCenter,
    #[default]
    BottomRight,
}

impl Position {
    pub fn as_str(self) -> &'static str {
        match self {
            Position::TopLeft => "top-left",
            Position::TopCenter => "top-center",
            Position::TopRight => "top-right",
            Position::LeftCenter => "left-center",
            Position::Center => "center",
            Position::RightCenter => "right-center",
            Position::BottomLeft => "bottom-left",
            Position::BottomCenter => "bottom-center",
            Position::BottomRight => "bottom-right",
        }
    }
}

/// Watermark-style overlay drawn on top of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    pub content: OverlayContent,
    #[serde(default)]
    pub position: Position,
    /// Distance from the anchored edges, in pixels.
    #[serde(default)]
    pub inset: u32,
}

impl Overlay {
    pub fn has_effect(&self) -> bool {
        match &self.content {
            OverlayContent::Text(text) => !text.is_empty(),
            OverlayContent::Image(uri) => !uri.is_empty(),
        }
    }

    pub fn canonical_fragment(&self) -> String {
        let content = match &self.content {
            OverlayContent::Text(text) => format!("text:{text}"),
            OverlayContent::Image(uri) => format!("image:{uri}"),
        };
        format!("{}_{}_{}", content, self.position.as_str(), self.inset)
    }
}
