//! Advisory file locking.
//!
//! The broker serialises access to files with per-path reader/writer locks:
//! reads and downloads take a shared guard, writes, moves, deletes and
//! transfer copies take an exclusive guard. Guards release on drop, so a
//! handler that errors out part-way never leaves a file locked.
//!
//! Locks are keyed by canonical path, so two names for the same file share
//! one lock. Entries stay in the table for the lifetime of the process;
//! the table is bounded by the number of distinct files touched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Guard for shared (read) access to a file.
pub type SharedGuard = OwnedRwLockReadGuard<()>;

/// Guard for exclusive (write) access to a file.
pub type ExclusiveGuard = OwnedRwLockWriteGuard<()>;

/// Per-path reader/writer lock table.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl LockManager {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire a shared lock on the given path, waiting if necessary.
    pub async fn lock_shared(&self, path: &Path) -> SharedGuard {
        self.lock_for(path).read_owned().await
    }

    /// Acquire an exclusive lock on the given path, waiting if necessary.
    pub async fn lock_exclusive(&self, path: &Path) -> ExclusiveGuard {
        self.lock_for(path).write_owned().await
    }

    /// Try to acquire an exclusive lock without waiting.
    pub fn try_lock_exclusive(&self, path: &Path) -> Option<ExclusiveGuard> {
        self.lock_for(path).try_write_owned().ok()
    }
}
