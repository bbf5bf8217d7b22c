//! The remote file interface: the narrowest possible view of a
//! user-chosen sync backend (WebDAV, object store, local folder, …).
//!
//! Whether the backend supports ETags is irrelevant; optimistic
//! concurrency rides on the `sync_version` inside the blob.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SyncError;

/// User-implemented remote storage. Implementations handle the actual
/// network or filesystem I/O.
#[async_trait]
pub trait RemoteFile: Send + Sync {
    /// Download a file's bytes; `None` when the file does not exist.
    async fn download(&self, path: &str) -> Result<Option<Vec<u8>>, SyncError>;

    /// Upload (replace) a file, returning a backend revision id.
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<String, SyncError>;
}

/// In-memory `RemoteFile`, shared by cloning. Used in tests and as the
/// reference implementation of the contract.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<MemoryRemoteInner>,
}

#[derive(Default)]
struct MemoryRemoteInner {
    files: HashMap<String, Vec<u8>>,
    rev: u64,
    fail_downloads: bool,
    fail_uploads: bool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent downloads fail with a transient error.
    pub fn set_fail_downloads(&self, fail: bool) {
        self.inner.lock().fail_downloads = fail;
    }

    /// Make subsequent uploads fail with a transient error.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.inner.lock().fail_uploads = fail;
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(path).cloned()
    }

    pub fn put_file(&self, path: &str, bytes: Vec<u8>) {
        self.inner.lock().files.insert(path.to_string(), bytes);
    }
}

#[async_trait]
impl RemoteFile for MemoryRemote {
    async fn download(&self, path: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let inner = self.inner.lock();
        if inner.fail_downloads {
            return Err(SyncError::Transport("simulated download failure".into()));
        }
        Ok(inner.files.get(path).cloned())
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<String, SyncError> {
        let mut inner = self.inner.lock();
        if inner.fail_uploads {
            return Err(SyncError::Transport("simulated upload failure".into()));
        }
        inner.files.insert(path.to_string(), bytes.to_vec());
        inner.rev += 1;
        Ok(format!("rev-{}", inner.rev))
    }
}
