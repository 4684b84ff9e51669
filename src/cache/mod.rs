//! Derivative cache.
//!
//! Transforming an image is the expensive part of serving it. This module
//! lets the representation layer skip that work when a derivative for the
//! same canonical [`OperationList`] was produced before.
//!
//! # Design
//!
//! The cache is split in two layers:
//!
//! - [`CacheStore`] is the storage medium: a key/value store of byte
//!   channels. It knows nothing about images. [`HeapCacheStore`] keeps
//!   entries in memory, [`FilesystemCacheStore`] on disk.
//! - [`DerivativeCache`] is the coordinator the rest of the crate talks to.
//!   It speaks in operation lists and derives the key with
//!   [`OperationList::cache_key`].
//!
//! ## Cache keys
//!
//! Keys are **content-addressed** on the canonical state of the operation
//! list: `<hash(identifier)>_<hash(operations and options)>.<extension>`.
//! Operations without effect do not contribute, so requests that differ only
//! by identity steps share an entry.
//!
//! ## Visibility
//!
//! An entry is either absent or complete. Writers stream into a pending
//! area and only [`CacheWriter::commit`] publishes the bytes; dropping an
//! uncommitted writer discards them. No reader ever observes a partial
//! entry.
//!
//! ## Concurrency
//!
//! Two concurrent misses for the same key may both produce and commit the
//! derivative. The last commit wins; both entries are complete, so only
//! efficiency suffers.

mod filesystem;
mod heap;

pub use filesystem::FilesystemCacheStore;
pub use heap::HeapCacheStore;

use crate::operation::OperationList;
use crate::representation::Outcome;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Bytes of the SHA-256 digest kept for cache keys (128 bits).
const HASH_BYTES: usize = 16;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),
}

/// Truncated SHA-256 of `input`, as 32 lowercase hex characters.
pub fn content_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..HASH_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Pending cache entry. Bytes become visible to readers only on
/// [`commit`](CacheWriter::commit); dropping the writer discards them.
pub trait CacheWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<(), CacheError>;
}

/// Storage medium for derivative bytes, addressed by cache key.
pub trait CacheStore: Send + Sync {
    /// Open a complete entry, or `None` if there isn't one.
    fn open_for_read(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>, CacheError>;

    /// Start a new entry for `key`, invisible until committed.
    fn open_for_write(&self, key: &str) -> Result<Box<dyn CacheWriter>, CacheError>;

    /// Discard the complete entry for `key`. Writers still in flight for
    /// the same key are unaffected and may publish afterwards.
    fn purge(&self, key: &str) -> Result<(), CacheError>;

    /// Discard every entry. Returns how many were removed.
    fn purge_all(&self) -> Result<usize, CacheError>;

    /// Discard leftovers of writers that died before committing, if the
    /// store can leave any behind. Returns how many were removed.
    fn purge_incomplete(&self, _older_than: Duration) -> Result<usize, CacheError> {
        Ok(0)
    }
}

/// Cache coordinator addressing entries by [`OperationList`].
#[derive(Clone)]
pub struct DerivativeCache {
    store: Arc<dyn CacheStore>,
}

impl DerivativeCache {
    pub fn new(store: impl CacheStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn open_for_read(
        &self,
        ops: &OperationList,
    ) -> Result<Option<Box<dyn Read + Send>>, CacheError> {
        let key = ops.cache_key();
        let reader = self.store.open_for_read(&key)?;
        debug!(%key, hit = reader.is_some(), "cache lookup");
        Ok(reader)
    }

    pub fn open_for_write(&self, ops: &OperationList) -> Result<Box<dyn CacheWriter>, CacheError> {
        let key = ops.cache_key();
        debug!(%key, "opening cache entry for writing");
        self.store.open_for_write(&key)
    }

    pub fn purge(&self, ops: &OperationList) -> Result<(), CacheError> {
        let key = ops.cache_key();
        debug!(%key, ops = %ops, "purging cache entry");
        self.store.purge(&key)
    }

    /// Purge, logging instead of returning a failure. Used on error paths
    /// where the original error must not be masked.
    pub fn purge_quietly(&self, ops: &OperationList) {
        if let Err(e) = self.purge(ops) {
            warn!(ops = %ops, error = %e, "failed to purge incomplete cache entry");
        }
    }

    pub fn purge_all(&self) -> Result<usize, CacheError> {
        self.store.purge_all()
    }

    /// Sweep unfinished writes idle for at least `older_than`.
    pub fn purge_incomplete(&self, older_than: Duration) -> Result<usize, CacheError> {
        let removed = self.store.purge_incomplete(older_than)?;
        debug!(removed, "swept unfinished cache entries");
        Ok(removed)
    }
}

impl fmt::Debug for DerivativeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivativeCache").finish_non_exhaustive()
    }
}

/// Reject keys that could escape a store's namespace.
pub(crate) fn validate_key(key: &str) -> Result<(), CacheError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_string()))
    }
}

/// Summary of how a batch of requests was served.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub streamed: u32,
    pub processed: u32,
    pub failed: u32,
}

impl CacheStats {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::CacheHit => self.hits += 1,
            Outcome::Streamed => self.streamed += 1,
            Outcome::Processed => self.processed += 1,
        }
    }

    pub fn fail(&mut self) {
        self.failed += 1;
    }

    pub fn merge(mut self, other: CacheStats) -> CacheStats {
        self.hits += other.hits;
        self.streamed += other.streamed;
        self.processed += other.processed;
        self.failed += other.failed;
        self
    }

    pub fn total(&self) -> u32 {
        self.hits + self.streamed + self.processed + self.failed
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(
                f,
                "{} cached, {} streamed, {} processed",
                self.hits, self.streamed, self.processed
            )?;
        } else {
            write!(f, "{} streamed, {} processed", self.streamed, self.processed)?;
        }
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        write!(f, " ({} total)", self.total())
    }
}
