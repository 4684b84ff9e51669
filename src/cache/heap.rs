//! In-memory cache store.

use super::{CacheError, CacheStore, CacheWriter, validate_key};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Entries = Arc<Mutex<HashMap<String, Arc<[u8]>>>>;

/// Cache store holding complete entries in a shared map.
///
/// Pending bytes live inside the writer until commit, so the map only ever
/// contains complete entries. Readers get a cheap shared handle to the
/// committed bytes.
#[derive(Debug, Default, Clone)]
pub struct HeapCacheStore {
    entries: Entries,
}

impl HeapCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Arc<[u8]>>> {
    // A panic while holding the lock cannot leave a half-inserted entry
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CacheStore for HeapCacheStore {
    fn open_for_read(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>, CacheError> {
        validate_key(key)?;
        Ok(lock(&self.entries)
            .get(key)
            .map(|bytes| Box::new(Cursor::new(Arc::clone(bytes))) as Box<dyn Read + Send>))
    }

    fn open_for_write(&self, key: &str) -> Result<Box<dyn CacheWriter>, CacheError> {
        validate_key(key)?;
        Ok(Box::new(HeapWriter {
            key: key.to_string(),
            buffer: Vec::new(),
            entries: Arc::clone(&self.entries),
        }))
    }

    fn purge(&self, key: &str) -> Result<(), CacheError> {
        validate_key(key)?;
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn purge_all(&self) -> Result<usize, CacheError> {
        let mut entries = lock(&self.entries);
        let count = entries.len();
        entries.clear();
        Ok(count)
    }
}

struct HeapWriter {
    key: String,
    buffer: Vec<u8>,
    entries: Entries,
}

impl Write for HeapWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CacheWriter for HeapWriter {
    fn commit(self: Box<Self>) -> Result<(), CacheError> {
        let HeapWriter {
            key,
            buffer,
            entries,
        } = *self;
        lock(&entries).insert(key, Arc::from(buffer));
        Ok(())
    }
}
