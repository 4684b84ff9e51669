//! Shared test doubles.
//!
//! | Helper | Stands in for |
//! |---|---|
//! | [`FailingSink`] | a client that disconnects after `n` bytes |
//! | [`TrackedReader`] | a source stream that reports when it is closed |
//! | [`MockProcessor`] | a processor that writes canned bytes, optionally failing |
//! | [`ScriptedProvider`] | delegate logic whose results name the loaded version |
//! | [`png_bytes`] | a small real PNG |

use crate::delegate::{DelegateError, DelegateProvider, MethodName};
use crate::format::Format;
use crate::operation::{Dimensions, OperationList};
use crate::processor::{FileProcessor, Processor, ProcessorError, StreamProcessor};
use image::{ImageFormat, RgbImage};
use serde_json::{Value, json};
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

// =========================================================================
// Sinks and sources
// =========================================================================

/// Accepts `n` bytes, then fails every write with `BrokenPipe`.
pub struct FailingSink {
    remaining: usize,
}

impl FailingSink {
    pub fn after(n: usize) -> Self {
        Self { remaining: n }
    }
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
        }
        let n = buf.len().min(self.remaining);
        self.remaining -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Set when the [`TrackedReader`] it belongs to is dropped.
#[derive(Clone, Default)]
pub struct CloseFlag(Arc<AtomicBool>);

impl CloseFlag {
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-memory source stream that records when it is closed.
pub struct TrackedReader {
    inner: Cursor<Vec<u8>>,
    closed: CloseFlag,
}

impl TrackedReader {
    pub fn new(bytes: &[u8]) -> (Self, CloseFlag) {
        let closed = CloseFlag::default();
        let reader = Self {
            inner: Cursor::new(bytes.to_vec()),
            closed: closed.clone(),
        };
        (reader, closed)
    }
}

impl Read for TrackedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.closed.0.store(true, Ordering::SeqCst);
    }
}

/// Encode a `width`x`height` gradient as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 4 % 256) as u8, (y * 4 % 256) as u8, 128])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

// =========================================================================
// Processor
// =========================================================================

/// Processor that writes fixed bytes and records what it was asked to do.
pub struct MockProcessor {
    output: Vec<u8>,
    fail: bool,
    file_mode: bool,
    stream_mode: bool,
    calls: AtomicUsize,
    last: Mutex<Option<(Format, Dimensions, String)>>,
}

impl MockProcessor {
    /// Writes `output` and succeeds.
    pub fn writing(output: &[u8]) -> Self {
        Self {
            output: output.to_vec(),
            fail: false,
            file_mode: true,
            stream_mode: true,
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    /// Writes `output`, then fails.
    pub fn failing_after(output: &[u8]) -> Self {
        Self {
            fail: true,
            ..Self::writing(output)
        }
    }

    pub fn file_only(self) -> Self {
        Self {
            stream_mode: false,
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Source format, full size and display string of the last request.
    pub fn last_call(&self) -> Option<(Format, Dimensions, String)> {
        self.last.lock().unwrap().clone()
    }

    fn produce(
        &self,
        ops: &OperationList,
        source_format: Format,
        full_size: Dimensions,
        output: &mut dyn Write,
    ) -> Result<(), ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((source_format, full_size, ops.display_string()));
        output.write_all(&self.output)?;
        if self.fail {
            return Err(ProcessorError::ProcessingFailed("mock failure".into()));
        }
        Ok(())
    }
}

impl FileProcessor for MockProcessor {
    fn process_file(
        &self,
        ops: &OperationList,
        source_format: Format,
        full_size: Dimensions,
        _source: &Path,
        output: &mut dyn Write,
    ) -> Result<(), ProcessorError> {
        self.produce(ops, source_format, full_size, output)
    }
}

impl StreamProcessor for MockProcessor {
    fn process_stream(
        &self,
        ops: &OperationList,
        source_format: Format,
        full_size: Dimensions,
        _source: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), ProcessorError> {
        self.produce(ops, source_format, full_size, output)
    }
}

impl Processor for MockProcessor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn file_processor(&self) -> Option<&dyn FileProcessor> {
        self.file_mode.then_some(self as &dyn FileProcessor)
    }

    fn stream_processor(&self) -> Option<&dyn StreamProcessor> {
        self.stream_mode.then_some(self as &dyn StreamProcessor)
    }
}

// =========================================================================
// Delegate provider
// =========================================================================

/// Delegate logic whose "code" is just a version string.
///
/// Method behavior:
/// - `missing` fails with method-not-found
/// - `nothing` returns null
/// - `rendezvous` waits on the shared barrier, then returns normally
/// - `hold` waits on the shared barrier twice: once to announce it is
///   running, once more before returning
/// - anything else returns `{version, method, args}`
pub struct ScriptedProvider {
    version: String,
    calls: AtomicUsize,
    rendezvous: Option<Arc<Barrier>>,
}

impl ScriptedProvider {
    /// Code that fails to load.
    pub const BROKEN: &'static str = "syntax error";

    pub fn new() -> Self {
        Self {
            version: String::new(),
            calls: AtomicUsize::new(0),
            rendezvous: None,
        }
    }

    pub fn with_rendezvous(barrier: Arc<Barrier>) -> Self {
        Self {
            rendezvous: Some(barrier),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DelegateProvider for ScriptedProvider {
    fn load(&mut self, code: &str) -> Result<(), DelegateError> {
        if code == Self::BROKEN {
            return Err(DelegateError::Load("unexpected token".into()));
        }
        self.version = code.to_string();
        Ok(())
    }

    fn invoke(&self, method: &MethodName, args: &[Value]) -> Result<Value, DelegateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match method.qualified().as_str() {
            "missing" => Err(DelegateError::MethodNotFound("missing".into())),
            "nothing" => Ok(Value::Null),
            "rendezvous" => {
                if let Some(barrier) = &self.rendezvous {
                    barrier.wait();
                }
                Ok(json!({ "version": self.version }))
            }
            "hold" => {
                if let Some(barrier) = &self.rendezvous {
                    barrier.wait();
                    barrier.wait();
                }
                Ok(json!({ "version": self.version }))
            }
            name => Ok(json!({
                "version": self.version,
                "method": name,
                "args": args,
            })),
        }
    }
}
