//! The operation-chain data model.
//!
//! | Part | Role |
//! |---|---|
//! | [`Operation`] | one transformation step, a closed sum over every kind |
//! | [`params`] | per-kind parameters and their effect/size/fragment rules |
//! | [`calculations`] | pure dimension math shared by the kinds |
//! | [`OperationList`] | ordered chain + identifier + output format + options |
//!
//! Dispatch is an exhaustive `match` on [`Operation`], so adding a kind is a
//! compile error everywhere it has not been handled yet.

pub mod calculations;
pub mod list;
pub mod params;

pub use list::OperationList;
pub use params::{
    Color, Crop, Overlay, OverlayContent, Position, Rotate, Scale, Sharpen, Transpose,
};

use crate::format::Format;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("operation list is frozen and cannot be modified")]
    Immutable,
}

/// Pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Discriminant of [`Operation`], used for lookups and canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Crop,
    Scale,
    Rotate,
    Transpose,
    Color,
    Sharpen,
    Overlay,
    MetadataCopy,
}

impl OperationKind {
    /// Lower-case name used in display strings and cache keys.
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Crop => "crop",
            OperationKind::Scale => "scale",
            OperationKind::Rotate => "rotate",
            OperationKind::Transpose => "transpose",
            OperationKind::Color => "color",
            OperationKind::Sharpen => "sharpen",
            OperationKind::Overlay => "overlay",
            OperationKind::MetadataCopy => "metadatacopy",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single transformation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Crop(Crop),
    Scale(Scale),
    Rotate(Rotate),
    Transpose(Transpose),
    Color(Color),
    Sharpen(Sharpen),
    Overlay(Overlay),
    /// Carry the source's embedded metadata into the derivative.
    MetadataCopy,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Crop(_) => OperationKind::Crop,
            Operation::Scale(_) => OperationKind::Scale,
            Operation::Rotate(_) => OperationKind::Rotate,
            Operation::Transpose(_) => OperationKind::Transpose,
            Operation::Color(_) => OperationKind::Color,
            Operation::Sharpen(_) => OperationKind::Sharpen,
            Operation::Overlay(_) => OperationKind::Overlay,
            Operation::MetadataCopy => OperationKind::MetadataCopy,
        }
    }

    /// Whether this step changes the output, judged without knowing the
    /// image size. Identity forms (full crop, unit scale, zero rotation)
    /// resolve to `false` here, which is what no-op detection relies on.
    pub fn has_effect(&self) -> bool {
        match self {
            Operation::Crop(crop) => crop.has_effect(),
            Operation::Scale(scale) => scale.has_effect(),
            Operation::Rotate(rotate) => rotate.has_effect(),
            Operation::Transpose(_) | Operation::Color(_) | Operation::MetadataCopy => true,
            Operation::Sharpen(sharpen) => sharpen.has_effect(),
            Operation::Overlay(overlay) => overlay.has_effect(),
        }
    }

    /// Size- and format-aware refinement of [`has_effect`](Self::has_effect).
    ///
    /// Never `true` where `has_effect` is `false`.
    pub fn has_effect_at(&self, full_size: Dimensions, output_format: Format) -> bool {
        match self {
            Operation::Crop(crop) => crop.has_effect_at(full_size),
            Operation::Scale(scale) => scale.has_effect_at(full_size),
            Operation::MetadataCopy => matches!(
                output_format,
                Format::Jpg | Format::Jp2 | Format::Png | Format::Tif | Format::Webp
            ),
            other => other.has_effect(),
        }
    }

    /// Project how this step transforms `input` dimensions.
    pub fn resulting_size(&self, input: Dimensions) -> Dimensions {
        match self {
            Operation::Crop(crop) => crop.resulting_size(input),
            Operation::Scale(scale) => scale.resulting_size(input),
            Operation::Rotate(_)
            | Operation::Transpose(_)
            | Operation::Color(_)
            | Operation::Sharpen(_)
            | Operation::Overlay(_)
            | Operation::MetadataCopy => input,
        }
    }

    /// Stable encoding of the effective parameters.
    pub fn canonical_fragment(&self) -> String {
        match self {
            Operation::Crop(crop) => crop.canonical_fragment(),
            Operation::Scale(scale) => scale.canonical_fragment(),
            Operation::Rotate(rotate) => rotate.canonical_fragment(),
            Operation::Transpose(transpose) => transpose.canonical_fragment(),
            Operation::Color(color) => color.canonical_fragment(),
            Operation::Sharpen(sharpen) => sharpen.canonical_fragment(),
            Operation::Overlay(overlay) => overlay.canonical_fragment(),
            Operation::MetadataCopy => "copy".to_string(),
        }
    }

    /// Structured form for delegates and logs.
    ///
    /// Crop and scale report the concrete geometry they resolve to at
    /// `full_size`.
    pub fn to_map(&self, full_size: Dimensions) -> Value {
        let class = self.kind().name();
        match self {
            Operation::Crop(crop) => {
                let r = crop.rectangle(full_size);
                json!({
                    "class": class,
                    "x": r.x,
                    "y": r.y,
                    "width": r.width,
                    "height": r.height,
                })
            }
            Operation::Scale(scale) => {
                let size = scale.resulting_size(full_size);
                json!({
                    "class": class,
                    "width": size.width,
                    "height": size.height,
                })
            }
            Operation::Rotate(rotate) => json!({ "class": class, "degrees": rotate.normalized() }),
            Operation::Transpose(transpose) => {
                json!({ "class": class, "axis": transpose.canonical_fragment() })
            }
            Operation::Color(color) => json!({ "class": class, "transform": color.canonical_fragment() }),
            Operation::Sharpen(sharpen) => json!({ "class": class, "amount": sharpen.amount }),
            Operation::Overlay(overlay) => json!({
                "class": class,
                "content": overlay.content,
                "position": overlay.position.as_str(),
                "inset": overlay.inset,
            }),
            Operation::MetadataCopy => json!({ "class": class }),
        }
    }
}

impl From<Crop> for Operation {
    fn from(value: Crop) -> Self {
        Operation::Crop(value)
    }
}

impl From<Scale> for Operation {
    fn from(value: Scale) -> Self {
        Operation::Scale(value)
    }
}

impl From<Rotate> for Operation {
    fn from(value: Rotate) -> Self {
        Operation::Rotate(value)
    }
}

impl From<Transpose> for Operation {
    fn from(value: Transpose) -> Self {
        Operation::Transpose(value)
    }
}

impl From<Color> for Operation {
    fn from(value: Color) -> Self {
        Operation::Color(value)
    }
}

impl From<Sharpen> for Operation {
    fn from(value: Sharpen) -> Self {
        Operation::Sharpen(value)
    }
}

impl From<Overlay> for Operation {
    fn from(value: Overlay) -> Self {
        Operation::Overlay(value)
    }
}
