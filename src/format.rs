//! Image formats and source identifiers.
//!
//! A [`Format`] plays two roles: the *source format* of the bytes a resolver
//! hands us, and the *output format* a client asked for. When the two match
//! and no operation has an effect, the source can be streamed verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Image formats known to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Bmp,
    Gif,
    Jp2,
    Jpg,
    Pdf,
    Png,
    Tif,
    Webp,
}

impl Format {
    pub const ALL: [Format; 8] = [
        Format::Bmp,
        Format::Gif,
        Format::Jp2,
        Format::Jpg,
        Format::Pdf,
        Format::Png,
        Format::Tif,
        Format::Webp,
    ];

    /// Extension used for cache keys, filenames and display strings.
    pub fn preferred_extension(self) -> &'static str {
        self.extensions()[0]
    }

    /// All recognized extensions, preferred first.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Format::Bmp => &["bmp"],
            Format::Gif => &["gif"],
            Format::Jp2 => &["jp2", "j2k", "jpx"],
            Format::Jpg => &["jpg", "jpeg"],
            Format::Pdf => &["pdf"],
            Format::Png => &["png"],
            Format::Tif => &["tif", "tiff", "ptif"],
            Format::Webp => &["webp"],
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            Format::Bmp => "image/bmp",
            Format::Gif => "image/gif",
            Format::Jp2 => "image/jp2",
            Format::Jpg => "image/jpeg",
            Format::Pdf => "application/pdf",
            Format::Png => "image/png",
            Format::Tif => "image/tiff",
            Format::Webp => "image/webp",
        }
    }

    /// Look up a format by file extension (case-insensitive, no leading dot).
    pub fn from_extension(ext: &str) -> Option<Format> {
        let ext = ext.to_ascii_lowercase();
        Format::ALL
            .into_iter()
            .find(|f| f.extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.preferred_extension())
    }
}

/// Opaque, user-supplied name of a source image.
///
/// It may or may not end in a recognizable format suffix; nothing else about
/// its structure is assumed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Format implied by the identifier's suffix, if any.
    ///
    /// `"images/cat.JPG"` → `Some(Jpg)`, `"cat"` → `None`,
    /// `"cat.unknown"` → `None`.
    pub fn source_format(&self) -> Option<Format> {
        let (stem, ext) = self.0.rsplit_once('.')?;
        if stem.is_empty() || ext.contains('/') {
            return None;
        }
        Format::from_extension(ext)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}
