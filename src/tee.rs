//! A writer that duplicates every byte into two sinks.
//!
//! Used on a cache miss to stream a derivative to the client and into the
//! cache at the same time. Either sink failing fails the whole write, which
//! is what lets the caller purge a half-written cache entry.

use std::io::{self, Write};

pub struct TeeWriter<A, B> {
    primary: A,
    secondary: B,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.primary, self.secondary)
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Both sinks must see the same bytes, so partial writes are not
        // passed through.
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}
