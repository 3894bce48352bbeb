// src/cache.rs
use crate::http::Response;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

struct CacheEntry {
    response: Arc<Response>,
    modified: SystemTime,
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    Hit(Arc<Response>),
    Miss,
    /// The file changed since it was cached; the entry was dropped.
    Stale,
    /// The file is gone; the entry was dropped.
    Evicted,
}

/// Rendered file responses keyed by canonical path.
///
/// Entries are only ever invalidated on access: an entry is served while the
/// caller-observed modification time equals the stored one. Callers stat the
/// file before calling in, so no filesystem access happens under the lock.
#[derive(Default)]
pub struct FileCache {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `current` is the file's modification time right now, `None` if it no
    /// longer exists.
    pub fn lookup(&self, path: &Path, current: Option<SystemTime>) -> Lookup {
        let mut entries = self.lock();
        let Some(entry) = entries.get(path) else {
            return Lookup::Miss;
        };

        match current {
            None => {
                entries.remove(path);
                Lookup::Evicted
            }
            Some(modified) if modified != entry.modified => {
                entries.remove(path);
                Lookup::Stale
            }
            Some(_) => Lookup::Hit(Arc::clone(&entry.response)),
        }
    }

    /// Insert or overwrite. Two racing writers for the same path render the
    /// same bytes, so the last one simply wins.
    pub fn store(&self, path: PathBuf, response: Arc<Response>, modified: SystemTime) {
        self.lock().insert(path, CacheEntry { response, modified });
    }

    pub fn evict(&self, path: &Path) -> bool {
        self.lock().remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
