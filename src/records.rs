//! In-memory change records: path → last successfully ingested modification time.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

/// Tracks which version of each file the index has confirmed.
///
/// Shared by reference between the watcher path and manual triggers.
/// Entries only move forward in time.
#[derive(Default)]
pub struct ChangeRecordStore {
    records: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
    path_locks: Mutex<HashMap<PathBuf, Arc<TokioMutex<()>>>>,
}

impl ChangeRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<PathBuf, DateTime<Utc>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.records().get(path).copied()
    }

    /// True when `modified` is strictly newer than what was recorded (or nothing was).
    pub fn is_stale(&self, path: &Path, modified: DateTime<Utc>) -> bool {
        match self.get(path) {
            Some(recorded) => modified > recorded,
            None => true,
        }
    }

    /// Atomically record `modified` for `path` if it is newer than the current entry.
    ///
    /// Returns whether the record moved.
    pub fn advance(&self, path: &Path, modified: DateTime<Utc>) -> bool {
        let mut records = self.records();
        match records.get(path) {
            Some(recorded) if *recorded >= modified => false,
            _ => {
                records.insert(path.to_path_buf(), modified);
                true
            }
        }
    }

    /// Merge entries discovered elsewhere (e.g. a loaded snapshot) without regressing any.
    pub fn seed<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (PathBuf, DateTime<Utc>)>,
    {
        entries
            .into_iter()
            .filter(|(path, modified)| self.advance(path, *modified))
            .count()
    }

    pub fn clear(&self) {
        self.records().clear();
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Hold the lock serializing ingestion of a single path.
    ///
    /// The per-path entry lives only while someone holds or awaits it.
    pub async fn lock_path(&self, path: &Path) -> PathGuard<'_> {
        let lock = {
            let mut locks = self.locks();
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        PathGuard {
            guard: Some(lock.lock_owned().await),
            store: self,
            path: path.to_path_buf(),
        }
    }

    /// Paths with a live ingestion lock.
    pub fn lock_count(&self) -> usize {
        self.locks().len()
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<TokioMutex<()>>>> {
        self.path_locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PathGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    store: &'a ChangeRecordStore,
    path: PathBuf,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // Release our clone of the lock before counting holders
        self.guard.take();
        let mut locks = self.store.locks();
        if locks
            .get(&self.path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.path);
        }
    }
}
