//! Error types surfaced by the storage API

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned when opening a [`crate::storage::Storage`].
///
/// Serving-mode ingestion never fails: out-of-range rows are dropped and
/// counted instead (see [`crate::storage::StorageStats`]).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage directory is locked by another process.
    ///
    /// Retrying in-process is pointless: the lock is held for the owning
    /// process' lifetime.
    #[error("storage at {path} is already opened by another process (lock file {lock_path} is held)")]
    AlreadyOpen { path: PathBuf, lock_path: PathBuf },

    /// The on-disk state cannot be brought to a serving state.
    ///
    /// There is no automatic recovery; the embedding service is expected
    /// to abort.
    #[error("fatal storage startup error: {0}")]
    Startup(#[from] anyhow::Error),
}
