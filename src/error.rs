//! Error taxonomy for the sync core.
//!
//! `StoreError` covers the persistence layer; `SyncError` is the single
//! error channel everything else reports through. Transient errors are
//! retried by the orchestrator; all other kinds surface to the caller.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no state cache backup to restore")]
    NoStateCacheBackup,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Network or remote-storage hiccup. Safe to retry; no state changed.
    #[error("transient remote error: {0}")]
    Transport(String),

    #[error("remote I/O timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("remote blob decode error: {0}")]
    BlobDecode(String),

    #[error("remote blob checksum mismatch (expected {expected}, got {actual})")]
    CorruptBlob { expected: String, actual: String },

    #[error("remote blob format marker {found} is not supported (expected {supported})")]
    UnknownBlobFormat { found: u32, supported: u32 },

    /// The remote was written by a newer app version. The store is left
    /// untouched; the user must upgrade.
    #[error("remote schema version {remote} is newer than this client supports ({local})")]
    SchemaTooNew { remote: u32, local: u32 },

    #[error("no local client id; store is not initialized for writes")]
    MissingClientId,

    #[error("conflict resolution did not converge after {rounds} rewrite rounds")]
    RewriteBudgetExhausted { rounds: usize },

    /// Migration failed AND the backup restore failed. The cache has been
    /// cleared so the next cold start rebuilds from the log.
    #[error("state cache migration failed ({migrate}); backup restore also failed ({restore}); cache cleared")]
    StateCacheRecovery { migrate: String, restore: String },

    #[error("applier error: {0}")]
    Applier(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the caller may simply retry later without user intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Timeout(_))
    }
}
