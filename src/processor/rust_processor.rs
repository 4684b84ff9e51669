//! Pure Rust processor built on the `image` crate.
//!
//! ## Operation mapping
//!
//! | Operation | `image` call |
//! |---|---|
//! | Decode (BMP, GIF, JPEG, PNG, TIFF, WebP) | `ImageReader` / `load_from_memory_with_format` |
//! | Crop | `DynamicImage::crop_imm` on the clipped rectangle |
//! | Scale | `DynamicImage::resize_exact` with `Lanczos3` |
//! | Rotate (right angles) | `rotate90` / `rotate180` / `rotate270` |
//! | Transpose | `fliph` / `flipv` |
//! | Gray / bitonal | `grayscale`, then a fixed threshold for bitonal |
//! | Sharpen | `DynamicImage::unsharpen` |
//! | Encode | `DynamicImage::write_to` into an in-memory buffer |
//!
//! JPEG 2000 and PDF have no pure Rust codec here and are rejected, as are
//! overlays and arbitrary-angle rotation. Metadata copy is accepted and
//! ignored: the encoders write no embedded metadata.

use super::{FileProcessor, Processor, ProcessorError, StreamProcessor};
use crate::format::Format;
use crate::operation::calculations::DELTA;
use crate::operation::{Color, Dimensions, Operation, OperationKind, OperationList, Transpose};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GrayImage, ImageFormat, ImageReader};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::Instant;
use tracing::debug;

/// Luma value at or above which a bitonal pixel becomes white.
const BITONAL_THRESHOLD: u8 = 128;

/// Processor backed by the `image` crate. Supports both access modes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustProcessor;

impl RustProcessor {
    pub fn new() -> Self {
        Self
    }

    fn run(
        &self,
        ops: &OperationList,
        full_size: Dimensions,
        image: DynamicImage,
        output: &mut dyn Write,
    ) -> Result<(), ProcessorError> {
        let started = Instant::now();
        let decoded = Dimensions::new(image.width(), image.height());
        if decoded != full_size {
            debug!(expected = %full_size, actual = %decoded, "source size differs from reported size");
        }

        let image = ops
            .iter()
            .try_fold(image, |image, op| apply(image, op))?;
        let bytes = encode(image, ops.output_format())?;
        output.write_all(&bytes)?;

        debug!(
            ops = %ops,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processed derivative"
        );
        Ok(())
    }
}

fn image_format(format: Format) -> Result<ImageFormat, ProcessorError> {
    match format {
        Format::Bmp => Ok(ImageFormat::Bmp),
        Format::Gif => Ok(ImageFormat::Gif),
        Format::Jpg => Ok(ImageFormat::Jpeg),
        Format::Png => Ok(ImageFormat::Png),
        Format::Tif => Ok(ImageFormat::Tiff),
        Format::Webp => Ok(ImageFormat::WebP),
        Format::Jp2 | Format::Pdf => Err(ProcessorError::UnsupportedFormat(format)),
    }
}

/// Apply one step to a decoded image.
fn apply(image: DynamicImage, op: &Operation) -> Result<DynamicImage, ProcessorError> {
    if !op.has_effect() {
        return Ok(image);
    }
    let size = Dimensions::new(image.width(), image.height());
    let out = match op {
        Operation::Crop(crop) => {
            if !crop.has_effect_at(size) {
                return Ok(image);
            }
            let r = crop.rectangle(size);
            image.crop_imm(r.x, r.y, r.width, r.height)
        }
        Operation::Scale(scale) => {
            let target = scale.resulting_size(size);
            if target == size {
                return Ok(image);
            }
            image.resize_exact(target.width, target.height, FilterType::Lanczos3)
        }
        Operation::Rotate(rotate) => {
            let degrees = rotate.normalized();
            if (degrees - 90.0).abs() < DELTA {
                image.rotate90()
            } else if (degrees - 180.0).abs() < DELTA {
                image.rotate180()
            } else if (degrees - 270.0).abs() < DELTA {
                image.rotate270()
            } else {
                return Err(ProcessorError::UnsupportedOperation {
                    kind: OperationKind::Rotate,
                    detail: format!("{degrees} degrees"),
                });
            }
        }
        Operation::Transpose(Transpose::Horizontal) => image.fliph(),
        Operation::Transpose(Transpose::Vertical) => image.flipv(),
        Operation::Color(Color::Gray) => image.grayscale(),
        Operation::Color(Color::Bitonal) => DynamicImage::ImageLuma8(bitonal(&image)),
        Operation::Sharpen(sharpen) => image.unsharpen(sharpen.amount, 0),
        Operation::Overlay(_) => {
            return Err(ProcessorError::UnsupportedOperation {
                kind: OperationKind::Overlay,
                detail: "overlays are not rendered by this processor".into(),
            });
        }
        Operation::MetadataCopy => image,
    };
    Ok(out)
}

fn bitonal(image: &DynamicImage) -> GrayImage {
    let mut luma = image.to_luma8();
    for pixel in luma.pixels_mut() {
        pixel.0[0] = if pixel.0[0] >= BITONAL_THRESHOLD { 255 } else { 0 };
    }
    luma
}

/// Encode into memory so the caller's sink only ever sees a complete image.
fn encode(image: DynamicImage, format: Format) -> Result<Vec<u8>, ProcessorError> {
    let target = image_format(format)?;
    let image = match format {
        // 8-bit gray or RGB only, no alpha
        Format::Jpg if !matches!(image.color(), ColorType::L8 | ColorType::Rgb8) => {
            DynamicImage::ImageRgb8(image.to_rgb8())
        }
        Format::Gif => DynamicImage::ImageRgba8(image.to_rgba8()),
        _ => image,
    };
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, target)?;
    Ok(buffer.into_inner())
}

impl FileProcessor for RustProcessor {
    fn process_file(
        &self,
        ops: &OperationList,
        source_format: Format,
        full_size: Dimensions,
        source: &Path,
        output: &mut dyn Write,
    ) -> Result<(), ProcessorError> {
        let mut reader = ImageReader::open(source)?;
        reader.set_format(image_format(source_format)?);
        let image = reader.decode()?;
        self.run(ops, full_size, image, output)
    }
}

impl StreamProcessor for RustProcessor {
    fn process_stream(
        &self,
        ops: &OperationList,
        source_format: Format,
        full_size: Dimensions,
        source: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), ProcessorError> {
        let format = image_format(source_format)?;
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes)?;
        let image = image::load_from_memory_with_format(&bytes, format)?;
        self.run(ops, full_size, image, output)
    }
}

impl Processor for RustProcessor {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn file_processor(&self) -> Option<&dyn FileProcessor> {
        Some(self)
    }

    fn stream_processor(&self) -> Option<&dyn StreamProcessor> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Crop, Overlay, OverlayContent, Position, Rotate, Scale, Sharpen};
    use crate::test_helpers::png_bytes;

    const FULL: Dimensions = Dimensions::new(64, 48);

    fn render(ops: &OperationList) -> Result<DynamicImage, ProcessorError> {
        let source = png_bytes(FULL.width, FULL.height);
        let mut out = Vec::new();
        RustProcessor::new().process_stream(ops, Format::Png, FULL, &mut source.as_slice(), &mut out)?;
        let format = image_format(ops.output_format())?;
        Ok(image::load_from_memory_with_format(&out, format)?)
    }

    fn ops_with(format: Format, steps: Vec<Operation>) -> OperationList {
        let mut ops = OperationList::new("fixture.png", format);
        for step in steps {
            ops.add(step).unwrap();
        }
        ops
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    #[test]
    fn scale_produces_projected_size() {
        let ops = ops_with(Format::Png, vec![Scale::Percent(0.5).into()]);
        let img = render(&ops).unwrap();
        assert_eq!((img.width(), img.height()), (32, 24));
        assert_eq!(ops.resulting_size(FULL), Dimensions::new(32, 24));
    }

    #[test]
    fn crop_then_scale() {
        let ops = ops_with(
            Format::Png,
            vec![
                Crop::Pixels {
                    x: 4,
                    y: 4,
                    width: 40,
                    height: 20,
                }
                .into(),
                Scale::FitWidth(20).into(),
            ],
        );
        let img = render(&ops).unwrap();
        assert_eq!((img.width(), img.height()), (20, 10));
    }

    #[test]
    fn crop_is_clipped_to_image() {
        let ops = ops_with(
            Format::Png,
            vec![
                Crop::Pixels {
                    x: 60,
                    y: 40,
                    width: 100,
                    height: 100,
                }
                .into(),
            ],
        );
        let img = render(&ops).unwrap();
        assert_eq!((img.width(), img.height()), (4, 8));
    }

    #[test]
    fn right_angle_rotation_swaps_edges() {
        let ops = ops_with(Format::Png, vec![Rotate::new(90.0).into()]);
        let img = render(&ops).unwrap();
        assert_eq!((img.width(), img.height()), (48, 64));
    }

    #[test]
    fn arbitrary_rotation_is_unsupported() {
        let ops = ops_with(Format::Png, vec![Rotate::new(45.0).into()]);
        assert!(matches!(
            render(&ops),
            Err(ProcessorError::UnsupportedOperation {
                kind: OperationKind::Rotate,
                ..
            })
        ));
    }

    // =========================================================================
    // Pixels
    // =========================================================================

    #[test]
    fn bitonal_output_is_black_and_white() {
        let ops = ops_with(Format::Png, vec![Color::Bitonal.into()]);
        let img = render(&ops).unwrap().to_luma8();
        assert!(img.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn gray_and_sharpen_keep_size() {
        let ops = ops_with(
            Format::Png,
            vec![Color::Gray.into(), Sharpen::new(1.5).into(), Transpose::Horizontal.into()],
        );
        let img = render(&ops).unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));
    }

    #[test]
    fn overlay_is_unsupported() {
        let overlay = Overlay {
            content: OverlayContent::Text("(c) museum".into()),
            position: Position::BottomRight,
            inset: 4,
        };
        let ops = ops_with(Format::Png, vec![overlay.into()]);
        assert!(matches!(
            render(&ops),
            Err(ProcessorError::UnsupportedOperation {
                kind: OperationKind::Overlay,
                ..
            })
        ));
    }

    // =========================================================================
    // Formats
    // =========================================================================

    #[test]
    fn encodes_to_jpeg() {
        let ops = ops_with(Format::Jpg, vec![Scale::FitWidth(16).into()]);
        let img = render(&ops).unwrap();
        assert_eq!(img.width(), 16);
    }

    #[test]
    fn jp2_output_is_unsupported() {
        let ops = ops_with(Format::Jp2, vec![]);
        assert!(matches!(
            render(&ops),
            Err(ProcessorError::UnsupportedFormat(Format::Jp2))
        ));
    }

    #[test]
    fn file_mode_reads_from_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("fixture.png");
        std::fs::write(&path, png_bytes(FULL.width, FULL.height)).unwrap();

        let ops = ops_with(Format::Png, vec![Scale::FitHeight(12).into()]);
        let mut out = Vec::new();
        RustProcessor::new()
            .process_file(&ops, Format::Png, FULL, &path, &mut out)
            .unwrap();
        let img = image::load_from_memory_with_format(&out, ImageFormat::Png).unwrap();
        assert_eq!((img.width(), img.height()), (16, 12));
    }

    #[test]
    fn corrupt_source_is_an_image_error() {
        let ops = ops_with(Format::Png, vec![Scale::Percent(0.5).into()]);
        let mut out = Vec::new();
        let err = RustProcessor::new()
            .process_stream(&ops, Format::Png, FULL, &mut &b"not a png"[..], &mut out)
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Image(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn exposes_both_modes() {
        let p = RustProcessor::new();
        assert!(p.file_processor().is_some());
        assert!(p.stream_processor().is_some());
        assert_eq!(p.name(), "rust");
    }
}
