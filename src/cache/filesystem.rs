//! On-disk cache store.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── 3f/
//! │   ├── 3fa9…_81c0….jpg              # complete entry
//! │   └── 3fa9…_81c0….jpg.4121-7.part  # in-flight write (pid 4121, writer #7)
//! └── e0/
//!     └── …
//! ```
//!
//! Entries are sharded by the first two characters of the key so no single
//! directory grows unbounded.
//!
//! ## Atomic publication
//!
//! Each writer streams into its own uniquely named `.part` sibling and
//! renames it over the entry on commit. A rename within one directory is
//! atomic, so readers see either the old entry, the new one, or nothing.
//! An uncommitted writer removes its `.part` file when dropped, so purging a
//! key only ever touches the complete entry and never another request's
//! in-flight write. [`CacheStore::purge_incomplete`] sweeps
//! `.part` files left behind by a crashed process once they are old enough
//! that no live writer can still own them.

use super::{CacheError, CacheStore, CacheWriter, validate_key};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

const PARTIAL_SUFFIX: &str = ".part";

/// Distinguishes concurrent writers for the same key within this process.
static WRITER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Cache store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FilesystemCacheStore {
    root: PathBuf,
}

impl FilesystemCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        let shard: String = key.chars().take(2).collect();
        self.root.join(shard)
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        validate_key(key)?;
        Ok(self.shard_dir(key).join(key))
    }

    fn remove_files(&self, matches: impl Fn(&DirEntry) -> bool) -> Result<usize, CacheError> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| CacheError::Io(io::Error::other(e)))?;
            if entry.file_type().is_file() && matches(&entry) {
                remove_if_exists(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}

fn idle_for(entry: &DirEntry, age: Duration) -> bool {
    entry
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .is_some_and(|modified| modified.elapsed().unwrap_or_default() >= age)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl CacheStore for FilesystemCacheStore {
    fn open_for_read(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>, CacheError> {
        let path = self.entry_path(key)?;
        match File::open(&path) {
            Ok(file) => Ok(Some(Box::new(BufReader::new(file)) as Box<dyn Read + Send>)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open_for_write(&self, key: &str) -> Result<Box<dyn CacheWriter>, CacheError> {
        let target = self.entry_path(key)?;
        let dir = self.shard_dir(key);
        fs::create_dir_all(&dir)?;

        let sequence = WRITER_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let partial = dir.join(format!(
            "{key}.{}-{sequence}{PARTIAL_SUFFIX}",
            std::process::id()
        ));
        let file = File::create(&partial)?;
        debug!(path = %partial.display(), "writing cache entry");

        Ok(Box::new(FilesystemWriter {
            file: Some(BufWriter::new(file)),
            partial,
            target,
        }))
    }

    fn purge(&self, key: &str) -> Result<(), CacheError> {
        // In-flight `.part` files belong to their writers
        let target = self.entry_path(key)?;
        remove_if_exists(&target)?;
        Ok(())
    }

    fn purge_all(&self) -> Result<usize, CacheError> {
        self.remove_files(|_| true)
    }

    /// Remove `.part` files not modified for at least `older_than`, left
    /// behind by writers that never finished (e.g. the process was killed
    /// mid-write).
    ///
    /// Other processes may share the directory, so fresh `.part` files are
    /// left alone: a live writer touches its file with every write.
    fn purge_incomplete(&self, older_than: Duration) -> Result<usize, CacheError> {
        self.remove_files(|entry| is_partial(entry.path()) && idle_for(entry, older_than))
    }
}

struct FilesystemWriter {
    /// `None` once committed.
    file: Option<BufWriter<File>>,
    partial: PathBuf,
    target: PathBuf,
}

impl FilesystemWriter {
    fn file(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("cache writer already committed"))
    }

    fn publish(&mut self) -> io::Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("cache writer already committed"))?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.partial, &self.target)
    }
}

impl Write for FilesystemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl CacheWriter for FilesystemWriter {
    fn commit(mut self: Box<Self>) -> Result<(), CacheError> {
        if let Err(e) = self.publish() {
            if let Err(cleanup) = remove_if_exists(&self.partial) {
                warn!(path = %self.partial.display(), error = %cleanup, "failed to remove partial cache file");
            }
            return Err(e.into());
        }
        debug!(path = %self.target.display(), "committed cache entry");
        Ok(())
    }
}

impl Drop for FilesystemWriter {
    fn drop(&mut self) {
        // Still holding the file means the entry was never committed
        if let Some(file) = self.file.take() {
            drop(file);
            if let Err(e) = remove_if_exists(&self.partial) {
                warn!(path = %self.partial.display(), error = %e, "failed to remove partial cache file");
            }
        }
    }
}
