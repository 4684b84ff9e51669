//! Pixel-processing capability.
//!
//! A processor turns source bytes plus an [`OperationList`] into derivative
//! bytes. It is consumed through two access modes:
//!
//! | Mode | Trait | Source |
//! |---|---|---|
//! | file | [`FileProcessor`] | a path the processor opens itself |
//! | stream | [`StreamProcessor`] | a readable byte stream |
//!
//! A [`Processor`] exposes whichever modes it supports; the representation
//! layer picks the one matching its source and fails with a configuration
//! error when there is none.
//!
//! The built-in implementation is [`RustProcessor`], pure Rust on top of the
//! `image` crate. Other engines (libvips, Kakadu, a remote service) plug in
//! through the same traits.

pub mod rust_processor;

pub use rust_processor::RustProcessor;

use crate::format::Format;
use crate::operation::{Dimensions, OperationKind, OperationList};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(Format),
    #[error("Unsupported operation: {kind} ({detail})")]
    UnsupportedOperation { kind: OperationKind, detail: String },
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Processor that reads its source from a file.
pub trait FileProcessor {
    fn process_file(
        &self,
        ops: &OperationList,
        source_format: Format,
        full_size: Dimensions,
        source: &Path,
        output: &mut dyn Write,
    ) -> Result<(), ProcessorError>;
}

/// Processor that reads its source from a byte stream.
pub trait StreamProcessor {
    fn process_stream(
        &self,
        ops: &OperationList,
        source_format: Format,
        full_size: Dimensions,
        source: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), ProcessorError>;
}

/// A processing engine and the access modes it supports.
pub trait Processor: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    fn file_processor(&self) -> Option<&dyn FileProcessor> {
        None
    }

    fn stream_processor(&self) -> Option<&dyn StreamProcessor> {
        None
    }
}
