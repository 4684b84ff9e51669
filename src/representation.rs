//! Writing a derivative to a client.
//!
//! [`ImageRepresentation`] ties one request together: the operation list,
//! the source and its format and size, and the processor that can transform
//! it. [`ImageRepresentation::write`] is the cache-aware write path:
//!
//! ```text
//! cache hit ──▶ copy cached bytes ──────────────────────────▶ sink
//! cache miss ─▶ render ─▶ TeeWriter ─┬──────────────────────▶ sink
//!                                    └─▶ CacheWriter ─▶ commit (on success)
//!                                                   └─▶ purge  (on failure)
//! no cache ───▶ render ─────────────────────────────────────▶ sink
//! ```
//!
//! Rendering either copies the source verbatim (the list is a no-op for the
//! source format) or runs the processor in the access mode matching the
//! source.
//!
//! The representation owns its source, so the file handle or stream is
//! released on every exit path once `write` returns. Cache writers are
//! dropped the same way; an uncommitted writer publishes nothing.

use crate::cache::{CacheError, DerivativeCache};
use crate::format::Format;
use crate::operation::{Dimensions, OperationList};
use crate::processor::{Processor, ProcessorError};
use crate::tee::TeeWriter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RepresentationError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessorError),
    #[error("Processor {processor} cannot read a {mode} source")]
    AccessMode {
        processor: &'static str,
        mode: &'static str,
    },
}

/// How a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Copied from a complete cache entry.
    CacheHit,
    /// Source copied verbatim; no processing needed.
    Streamed,
    /// Produced by a processor.
    Processed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::CacheHit => "cache hit",
            Outcome::Streamed => "streamed",
            Outcome::Processed => "processed",
        })
    }
}

/// Where the source image bytes come from.
pub enum Source {
    File(PathBuf),
    Stream(Box<dyn Read + Send>),
}

impl Source {
    fn mode(&self) -> &'static str {
        match self {
            Source::File(_) => "file",
            Source::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File(path) => f.debug_tuple("File").field(path).finish(),
            Source::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// One derivative, ready to be written.
pub struct ImageRepresentation<'a> {
    ops: &'a OperationList,
    source_format: Format,
    full_size: Dimensions,
    source: Source,
    processor: &'a dyn Processor,
}

impl<'a> ImageRepresentation<'a> {
    pub fn new(
        ops: &'a OperationList,
        source_format: Format,
        full_size: Dimensions,
        source: Source,
        processor: &'a dyn Processor,
    ) -> Self {
        Self {
            ops,
            source_format,
            full_size,
            source,
            processor,
        }
    }

    /// Write the derivative to `sink`, consulting and populating `cache`
    /// when one is given.
    ///
    /// On a miss, a failure while rendering (processor, cache writer, or the
    /// sink itself) purges the key before the error is returned, so no reader
    /// ever sees an entry that stopped mid-stream. Once the client has every
    /// byte, a failed commit only costs the cache entry: it is logged and the
    /// write still succeeds.
    pub fn write(
        self,
        sink: &mut dyn Write,
        cache: Option<&DerivativeCache>,
    ) -> Result<Outcome, RepresentationError> {
        let Some(cache) = cache else {
            return self.render(sink);
        };
        let ops = self.ops;

        if let Some(mut cached) = cache.open_for_read(ops)? {
            drop(self);
            let started = Instant::now();
            let bytes = io::copy(&mut cached, sink)?;
            debug!(ops = %ops, bytes, elapsed_ms = started.elapsed().as_millis() as u64, "served from cache");
            return Ok(Outcome::CacheHit);
        }

        let mut writer = cache.open_for_write(ops)?;
        let rendered = {
            let mut tee = TeeWriter::new(&mut *sink, writer.as_mut());
            self.render(&mut tee)
                .and_then(|outcome| tee.flush().map(|()| outcome).map_err(Into::into))
        };

        match rendered {
            Ok(outcome) => {
                if let Err(e) = writer.commit() {
                    warn!(ops = %ops, error = %e, "failed to commit cache entry");
                }
                Ok(outcome)
            }
            Err(e) => {
                debug!(ops = %ops, error = %e, "write failed, discarding cache entry");
                drop(writer);
                cache.purge_quietly(ops);
                Err(e)
            }
        }
    }

    /// Produce the derivative into `sink` without touching any cache.
    fn render(self, sink: &mut dyn Write) -> Result<Outcome, RepresentationError> {
        let started = Instant::now();
        let ImageRepresentation {
            ops,
            source_format,
            full_size,
            source,
            processor,
        } = self;

        if ops.is_no_op_for(source_format) {
            let bytes = match source {
                Source::File(path) => io::copy(&mut BufReader::new(File::open(path)?), sink)?,
                Source::Stream(mut stream) => io::copy(&mut stream, sink)?,
            };
            debug!(ops = %ops, bytes, elapsed_ms = started.elapsed().as_millis() as u64, "streamed source");
            return Ok(Outcome::Streamed);
        }

        let mode = source.mode();
        let unsupported = || RepresentationError::AccessMode {
            processor: processor.name(),
            mode,
        };
        match source {
            Source::File(path) => {
                let fp = processor.file_processor().ok_or_else(unsupported)?;
                fp.process_file(ops, source_format, full_size, &path, sink)?;
            }
            Source::Stream(mut stream) => {
                let sp = processor.stream_processor().ok_or_else(unsupported)?;
                sp.process_stream(ops, source_format, full_size, &mut stream, sink)?;
            }
        }
        debug!(
            ops = %ops,
            processor = processor.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processed"
        );
        Ok(Outcome::Processed)
    }
}

// =============================================================================
// Content-Disposition
// =============================================================================

/// How the derivative should be presented by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentDisposition {
    /// No header.
    #[default]
    None,
    Inline,
    Attachment,
}

/// `Content-Disposition` header value for a derivative, if one is wanted.
///
/// The filename is the identifier with anything outside `[A-Za-z0-9._-]`
/// replaced by `_`, plus the output extension.
pub fn content_disposition(ops: &OperationList, setting: ContentDisposition) -> Option<String> {
    let kind = match setting {
        ContentDisposition::None => return None,
        ContentDisposition::Inline => "inline",
        ContentDisposition::Attachment => "attachment",
    };
    let safe: String = ops
        .identifier()
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    Some(format!(
        "{kind}; filename=\"{safe}.{}\"",
        ops.output_format().preferred_extension()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, CacheWriter, FilesystemCacheStore, HeapCacheStore};
    use crate::processor::StreamProcessor;
    use crate::operation::{Rotate, Scale};
    use crate::test_helpers::{FailingSink, MockProcessor, TrackedReader};

    const FULL: Dimensions = Dimensions::new(300, 200);

    fn scaled_ops() -> OperationList {
        let mut ops = OperationList::new("cats/tabby.png", Format::Png);
        ops.add(Scale::Percent(0.5)).unwrap();
        ops.freeze();
        ops
    }

    fn no_op_ops() -> OperationList {
        let mut ops = OperationList::new("cats/tabby.png", Format::Png);
        ops.add(Rotate::new(0.0)).unwrap();
        ops.freeze();
        ops
    }

    fn cached_bytes(cache: &DerivativeCache, ops: &OperationList) -> Option<Vec<u8>> {
        cache.open_for_read(ops).unwrap().map(|mut r| {
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            out
        })
    }

    // =========================================================================
    // Rendering without cache
    // =========================================================================

    #[test]
    fn no_op_copies_source_without_processor() {
        let ops = no_op_ops();
        let processor = MockProcessor::writing(b"processed");
        let (reader, closed) = TrackedReader::new(b"original bytes");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);

        let mut out = Vec::new();
        assert_eq!(rep.write(&mut out, None).unwrap(), Outcome::Streamed);
        assert_eq!(out, b"original bytes");
        assert_eq!(processor.calls(), 0);
        assert!(closed.is_closed());
    }

    #[test]
    fn no_op_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("tabby.png");
        std::fs::write(&path, b"file bytes").unwrap();

        let ops = no_op_ops();
        let processor = MockProcessor::writing(b"processed");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::File(path), &processor);
        let mut out = Vec::new();
        assert_eq!(rep.write(&mut out, None).unwrap(), Outcome::Streamed);
        assert_eq!(out, b"file bytes");
    }

    #[test]
    fn format_change_is_processed() {
        let mut ops = OperationList::new("cats/tabby.png", Format::Jpg);
        ops.freeze();
        let processor = MockProcessor::writing(b"jpeg");
        let (reader, _) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);
        let mut out = Vec::new();
        assert_eq!(rep.write(&mut out, None).unwrap(), Outcome::Processed);
        assert_eq!(out, b"jpeg");
        assert_eq!(processor.calls(), 1);
    }

    #[test]
    fn missing_access_mode_is_an_error() {
        let ops = scaled_ops();
        let processor = MockProcessor::writing(b"x").file_only();
        let (reader, closed) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);
        let err = rep.write(&mut Vec::new(), None).unwrap_err();
        assert!(matches!(
            err,
            RepresentationError::AccessMode { mode: "stream", .. }
        ));
        assert!(closed.is_closed());
    }

    #[test]
    fn processor_receives_request_context() {
        let ops = scaled_ops();
        let processor = MockProcessor::writing(b"x");
        let (reader, _) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);
        rep.write(&mut Vec::new(), None).unwrap();
        assert_eq!(processor.last_call(), Some((Format::Png, FULL, ops.display_string())));
    }

    // =========================================================================
    // Cache-aware write path
    // =========================================================================

    #[test]
    fn miss_populates_cache_then_hit_skips_processor() {
        let cache = DerivativeCache::new(HeapCacheStore::new());
        let ops = scaled_ops();
        let processor = MockProcessor::writing(b"derivative");

        let (reader, _) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);
        let mut first = Vec::new();
        assert_eq!(rep.write(&mut first, Some(&cache)).unwrap(), Outcome::Processed);
        assert_eq!(cached_bytes(&cache, &ops), Some(b"derivative".to_vec()));

        let (reader, closed) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);
        let mut second = Vec::new();
        assert_eq!(rep.write(&mut second, Some(&cache)).unwrap(), Outcome::CacheHit);
        assert_eq!(first, second);
        assert_eq!(processor.calls(), 1);
        assert!(closed.is_closed());
    }

    #[test]
    fn no_op_is_cached_too() {
        let cache = DerivativeCache::new(HeapCacheStore::new());
        let ops = no_op_ops();
        let processor = MockProcessor::writing(b"unused");
        let (reader, _) = TrackedReader::new(b"source");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);
        rep.write(&mut Vec::new(), Some(&cache)).unwrap();
        assert_eq!(cached_bytes(&cache, &ops), Some(b"source".to_vec()));
    }

    #[test]
    fn client_disconnect_purges_entry_and_closes_source() {
        let cache = DerivativeCache::new(HeapCacheStore::new());
        let ops = scaled_ops();
        let processor = MockProcessor::writing(&[7u8; 4096]);
        let (reader, closed) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);

        let mut client = FailingSink::after(1000);
        let err = rep.write(&mut client, Some(&cache)).unwrap_err();
        assert!(matches!(err, RepresentationError::Processing(ProcessorError::Io(_))));
        assert!(cached_bytes(&cache, &ops).is_none());
        assert!(closed.is_closed());
    }

    #[test]
    fn client_disconnect_during_verbatim_copy_purges_entry() {
        let cache = DerivativeCache::new(HeapCacheStore::new());
        let ops = no_op_ops();
        let processor = MockProcessor::writing(b"unused");
        let (reader, closed) = TrackedReader::new(&[1u8; 64 * 1024]);
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);

        let err = rep.write(&mut FailingSink::after(10), Some(&cache)).unwrap_err();
        assert!(matches!(err, RepresentationError::Io(_)));
        assert!(cached_bytes(&cache, &ops).is_none());
        assert!(closed.is_closed());
    }

    #[test]
    fn processing_failure_purges_entry() {
        let cache = DerivativeCache::new(HeapCacheStore::new());
        let ops = scaled_ops();
        let processor = MockProcessor::failing_after(b"half an ima");
        let (reader, closed) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);

        let mut out = Vec::new();
        assert!(rep.write(&mut out, Some(&cache)).is_err());
        assert!(cached_bytes(&cache, &ops).is_none());
        assert!(closed.is_closed());
    }

    #[test]
    fn failed_write_does_not_hide_a_later_success() {
        let cache = DerivativeCache::new(HeapCacheStore::new());
        let ops = scaled_ops();

        let failing = MockProcessor::failing_after(b"x");
        let (reader, _) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &failing);
        assert!(rep.write(&mut Vec::new(), Some(&cache)).is_err());

        let working = MockProcessor::writing(b"good");
        let (reader, _) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &working);
        assert_eq!(rep.write(&mut Vec::new(), Some(&cache)).unwrap(), Outcome::Processed);
        assert_eq!(cached_bytes(&cache, &ops), Some(b"good".to_vec()));
    }

    // =========================================================================
    // Concurrent misses
    // =========================================================================

    /// Writes half of the derivative, then lets a second request for the same
    /// derivative fail against its own client before finishing.
    struct InterleavingProcessor<'a> {
        cache: &'a DerivativeCache,
        ops: &'a OperationList,
    }

    impl StreamProcessor for InterleavingProcessor<'_> {
        fn process_stream(
            &self,
            _ops: &OperationList,
            _source_format: Format,
            _full_size: Dimensions,
            _source: &mut dyn Read,
            output: &mut dyn Write,
        ) -> Result<(), ProcessorError> {
            output.write_all(b"deriv")?;

            let sibling = MockProcessor::writing(b"derivative");
            let (reader, _) = TrackedReader::new(b"png");
            let rep = ImageRepresentation::new(self.ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &sibling);
            let failed = rep.write(&mut FailingSink::after(3), Some(self.cache));
            assert!(failed.is_err());
            assert_eq!(sibling.calls(), 1);

            output.write_all(b"ative")?;
            Ok(())
        }
    }

    impl Processor for InterleavingProcessor<'_> {
        fn name(&self) -> &'static str {
            "interleaving"
        }

        fn stream_processor(&self) -> Option<&dyn StreamProcessor> {
            Some(self)
        }
    }

    #[test]
    fn failed_sibling_does_not_break_healthy_miss() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = DerivativeCache::new(FilesystemCacheStore::new(tmp.path()));
        let ops = scaled_ops();
        let processor = InterleavingProcessor {
            cache: &cache,
            ops: &ops,
        };

        let (reader, _) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);
        let mut client = Vec::new();
        assert_eq!(rep.write(&mut client, Some(&cache)).unwrap(), Outcome::Processed);
        assert_eq!(client, b"derivative");
        assert_eq!(cached_bytes(&cache, &ops), Some(b"derivative".to_vec()));
    }

    /// Accepts writes but refuses to publish them.
    struct UnpublishableStore;

    struct UnpublishableWriter;

    impl Write for UnpublishableWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CacheWriter for UnpublishableWriter {
        fn commit(self: Box<Self>) -> Result<(), CacheError> {
            Err(CacheError::Io(io::Error::other("disk full")))
        }
    }

    impl CacheStore for UnpublishableStore {
        fn open_for_read(&self, _key: &str) -> Result<Option<Box<dyn Read + Send>>, CacheError> {
            Ok(None)
        }

        fn open_for_write(&self, _key: &str) -> Result<Box<dyn CacheWriter>, CacheError> {
            Ok(Box::new(UnpublishableWriter))
        }

        fn purge(&self, _key: &str) -> Result<(), CacheError> {
            Ok(())
        }

        fn purge_all(&self) -> Result<usize, CacheError> {
            Ok(0)
        }
    }

    #[test]
    fn failed_commit_still_serves_the_client() {
        let cache = DerivativeCache::new(UnpublishableStore);
        let ops = scaled_ops();
        let processor = MockProcessor::writing(b"derivative");
        let (reader, _) = TrackedReader::new(b"png");
        let rep = ImageRepresentation::new(&ops, Format::Png, FULL, Source::Stream(Box::new(reader)), &processor);

        let mut client = Vec::new();
        assert_eq!(rep.write(&mut client, Some(&cache)).unwrap(), Outcome::Processed);
        assert_eq!(client, b"derivative");
    }

    // =========================================================================
    // Content-Disposition
    // =========================================================================

    #[test]
    fn content_disposition_variants() {
        let ops = scaled_ops();
        assert_eq!(content_disposition(&ops, ContentDisposition::None), None);
        assert_eq!(
            content_disposition(&ops, ContentDisposition::Inline).as_deref(),
            Some("inline; filename=\"cats_tabby.png.png\"")
        );
        assert_eq!(
            content_disposition(&ops, ContentDisposition::Attachment).as_deref(),
            Some("attachment; filename=\"cats_tabby.png.png\"")
        );
    }

    #[test]
    fn content_disposition_sanitizes_identifier() {
        let ops = OperationList::new("a b/\"c\".tif", Format::Jpg);
        assert_eq!(
            content_disposition(&ops, ContentDisposition::Attachment).as_deref(),
            Some("attachment; filename=\"a_b__c_.tif.jpg\"")
        );
    }
}
