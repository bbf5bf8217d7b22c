//! Single-file remote adapter with piggyback uploads.
//!
//! The classic optimistic-concurrency retry is replaced by absorption:
//! instead of failing on version skew, an upload merges whatever peers
//! wrote in the meantime into the new blob and hands those ops back to
//! the caller. Progress is bounded even under sustained multi-writer
//! contention.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::op::{now_ms, CompactOp};
use crate::sync::types::{DownloadOutcome, SyncRemote, UploadOutcome};

use super::blob::{BlobCodec, SyncBlob, BLOB_FORMAT_VERSION};
use super::file::RemoteFile;

/// `SyncRemote` over a single blob file on a `RemoteFile` backend.
pub struct FileRemoteAdapter {
    file: Arc<dyn RemoteFile>,
    codec: Arc<dyn BlobCodec>,
    path: String,
    config: SyncConfig,
    /// Last sync version seen per client id; skew against it is absorbed,
    /// not retried, so this is observability state only.
    expected_sync_versions: Mutex<HashMap<String, u64>>,
}

impl FileRemoteAdapter {
    pub fn new(
        file: Arc<dyn RemoteFile>,
        codec: Arc<dyn BlobCodec>,
        path: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            file,
            codec,
            path: path.into(),
            config,
            expected_sync_versions: Mutex::new(HashMap::new()),
        }
    }

    fn backup_path(&self) -> String {
        format!("{}.bak", self.path)
    }

    pub fn expected_sync_version(&self, client_id: &str) -> Option<u64> {
        self.expected_sync_versions.lock().get(client_id).copied()
    }

    fn check_schema(&self, blob: &SyncBlob) -> Result<()> {
        if blob.schema_version > self.config.schema_version {
            return Err(SyncError::SchemaTooNew {
                remote: blob.schema_version,
                local: self.config.schema_version,
            });
        }
        Ok(())
    }

    /// Download and decode the current blob plus its raw bytes; `None`
    /// when the remote has never been written.
    async fn load(&self) -> Result<Option<(SyncBlob, Vec<u8>)>> {
        match self.file.download(&self.path).await? {
            Some(bytes) => {
                let blob = self.codec.decode(&bytes)?;
                self.check_schema(&blob)?;
                Ok(Some((blob, bytes)))
            }
            None => Ok(None),
        }
    }

    /// Preserve the previous generation, then replace the blob.
    async fn replace(&self, new_blob: SyncBlob, previous: Option<&[u8]>) -> Result<u64> {
        let sync_version = new_blob.sync_version;
        let encoded = self.codec.encode(&new_blob.seal()?)?;
        if let Some(previous) = previous {
            self.file.upload(&self.backup_path(), previous).await?;
        }
        self.file.upload(&self.path, &encoded).await?;
        Ok(sync_version)
    }

    /// Peer ops beyond the caller's cursor, seq ascending.
    fn piggyback(blob: &SyncBlob, since_seq: u64, client_id: &str) -> Vec<CompactOp> {
        let mut ops: Vec<CompactOp> = blob
            .recent_ops
            .iter()
            .filter(|op| op.seq() > since_seq && op.client_id() != client_id)
            .cloned()
            .collect();
        ops.sort_by_key(CompactOp::seq);
        ops
    }

    /// Merge, dedup by op id, and trim the recent-ops window, advancing
    /// the dropped-through watermark for any evicted op.
    fn merge_recent_ops(
        existing: &[CompactOp],
        incoming: Vec<CompactOp>,
        window: usize,
        dropped_through_seq: u64,
    ) -> (Vec<CompactOp>, u64) {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut merged: Vec<CompactOp> = Vec::with_capacity(existing.len() + incoming.len());
        // Incoming first so a re-uploaded op replaces the stored copy.
        for op in incoming.into_iter().chain(existing.iter().cloned()) {
            if seen.insert(op.id) {
                merged.push(op);
            }
        }
        merged.sort_by_key(CompactOp::seq);

        let mut watermark = dropped_through_seq;
        while merged.len() > window {
            let evicted = merged.remove(0);
            watermark = watermark.max(evicted.seq());
        }
        (merged, watermark)
    }
}

#[async_trait]
impl SyncRemote for FileRemoteAdapter {
    async fn download_ops(&self, since_seq: u64, client_id: &str) -> Result<DownloadOutcome> {
        let Some((blob, _)) = self.load().await? else {
            debug!("remote is empty; nothing to download");
            return Ok(DownloadOutcome::empty(self.config.schema_version));
        };

        self.expected_sync_versions
            .lock()
            .insert(client_id.to_string(), blob.sync_version);

        let ops = Self::piggyback(&blob, since_seq, client_id);
        let truncated = since_seq < blob.dropped_through_seq;
        if truncated {
            warn!(
                since_seq,
                dropped_through = blob.dropped_through_seq,
                "cursor predates the recent-ops window; full-state fallback"
            );
        }

        Ok(DownloadOutcome {
            ops,
            latest_seq: blob.last_seq,
            vector_clock: blob.vector_clock.clone(),
            sync_version: blob.sync_version,
            schema_version: blob.schema_version,
            state: blob.state,
            truncated,
        })
    }

    async fn upload_ops(
        &self,
        ops: Vec<CompactOp>,
        client_id: &str,
        last_known_seq: u64,
        state: Value,
        protected: BTreeSet<String>,
    ) -> Result<UploadOutcome> {
        let loaded = self.load().await?;
        let (blob, previous_bytes) = match loaded {
            Some((blob, bytes)) => (blob, Some(bytes)),
            None => (SyncBlob::empty(self.config.schema_version), None),
        };

        let current_version = blob.sync_version;
        if let Some(expected) = self.expected_sync_version(client_id) {
            if expected != current_version {
                // Skew is absorbed, not retried; peers' ops ride back below.
                debug!(expected, found = current_version, "sync version skew absorbed");
            }
        }

        let new_ops = Self::piggyback(&blob, last_known_seq, client_id);

        let mut vector_clock = blob.vector_clock.clone();
        for op in &ops {
            vector_clock.merge(&op.vc);
        }
        let vector_clock = vector_clock.limit_size(
            self.config.max_vector_clock_size,
            &protected,
            client_id,
        );

        let (recent_ops, dropped_through_seq) = Self::merge_recent_ops(
            &blob.recent_ops,
            ops.clone(),
            self.config.recent_ops_window,
            blob.dropped_through_seq,
        );
        let last_seq = recent_ops
            .iter()
            .map(CompactOp::seq)
            .max()
            .unwrap_or(blob.last_seq)
            .max(blob.last_seq);

        let new_blob = SyncBlob {
            version: BLOB_FORMAT_VERSION,
            // Whatever was there wins; never expected + 1.
            sync_version: current_version + 1,
            schema_version: self.config.schema_version,
            vector_clock,
            last_seq,
            state,
            recent_ops,
            dropped_through_seq,
            archive_young: blob.archive_young,
            archive_old: blob.archive_old,
            checksum: String::new(),
            last_modified: now_ms(),
        };

        let sync_version = self.replace(new_blob, previous_bytes.as_deref()).await?;
        self.expected_sync_versions
            .lock()
            .insert(client_id.to_string(), sync_version);

        debug!(
            uploaded = ops.len(),
            piggybacked = new_ops.len(),
            sync_version,
            "upload complete"
        );
        Ok(UploadOutcome::Accepted {
            new_ops,
            sync_version,
        })
    }

    async fn upload_snapshot(
        &self,
        client_id: &str,
        state: Value,
        vector_clock: VectorClock,
        recent_ops: Vec<CompactOp>,
    ) -> Result<u64> {
        let loaded = self.load().await;
        // A corrupt or unreadable blob must not block the force path; the
        // whole point is to overwrite it.
        let (current_version, previous_bytes) = match loaded {
            Ok(Some((blob, bytes))) => (blob.sync_version, Some(bytes)),
            Ok(None) => (0, None),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(error = %e, "overwriting unreadable remote blob");
                (0, None)
            }
        };

        let last_seq = recent_ops.iter().map(CompactOp::seq).max().unwrap_or(0);
        let new_blob = SyncBlob {
            version: BLOB_FORMAT_VERSION,
            sync_version: current_version + 1,
            schema_version: self.config.schema_version,
            vector_clock,
            last_seq,
            state,
            recent_ops,
            dropped_through_seq: 0,
            archive_young: None,
            archive_old: None,
            checksum: String::new(),
            last_modified: now_ms(),
        };

        let sync_version = self.replace(new_blob, previous_bytes.as_deref()).await?;
        self.expected_sync_versions
            .lock()
            .insert(client_id.to_string(), sync_version);
        Ok(sync_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{generate_op_id, EntityKind, OpDraft, Operation};
    use crate::remote::blob::JsonCodec;
    use crate::remote::file::MemoryRemote;
    use serde_json::json;

    const PATH: &str = "sync.json";

    fn adapter(remote: Arc<MemoryRemote>) -> FileRemoteAdapter {
        FileRemoteAdapter::new(remote, Arc::new(JsonCodec), PATH, SyncConfig::default())
    }

    fn small_window_adapter(remote: Arc<MemoryRemote>, window: usize) -> FileRemoteAdapter {
        let config = SyncConfig {
            recent_ops_window: window,
            ..SyncConfig::default()
        };
        FileRemoteAdapter::new(remote, Arc::new(JsonCodec), PATH, config)
    }

    fn op(client: &str, seq: u64, counter: u64) -> CompactOp {
        OpDraft::update(EntityKind::Task, format!("t{seq}"), json!({"n": seq}))
            .into_operation(
                generate_op_id(),
                client,
                VectorClock::single(client, counter),
            )
            .compact(seq)
    }

    #[tokio::test]
    async fn download_from_empty_remote() {
        let adapter = adapter(Arc::new(MemoryRemote::new()));
        let outcome = adapter.download_ops(0, "A").await.unwrap();
        assert!(outcome.ops.is_empty());
        assert_eq!(outcome.sync_version, 0);
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn first_upload_creates_the_blob() {
        let remote = Arc::new(MemoryRemote::new());
        let adapter = adapter(remote.clone());
        let outcome = adapter
            .upload_ops(
                vec![op("A", 1, 1)],
                "A",
                0,
                json!({"tasks": {}}),
                BTreeSet::new(),
            )
            .await
            .unwrap();
        let UploadOutcome::Accepted {
            new_ops,
            sync_version,
        } = outcome
        else {
            panic!("expected accept");
        };
        assert!(new_ops.is_empty());
        assert_eq!(sync_version, 1);
        // No previous generation, so no backup yet.
        assert!(remote.file(&format!("{PATH}.bak")).is_none());
        assert!(remote.file(PATH).is_some());
    }

    #[tokio::test]
    async fn piggyback_returns_peer_ops_and_merges_them() {
        // The S-shaped two-writer interleaving: A uploads, then B (whose
        // cursor is behind) uploads and picks A's op up piggybacked.
        let remote = Arc::new(MemoryRemote::new());
        let adapter = adapter(remote.clone());

        adapter
            .upload_ops(vec![op("A", 10, 1)], "A", 0, json!({"from": "A"}), BTreeSet::new())
            .await
            .unwrap();

        let outcome = adapter
            .upload_ops(vec![op("B", 1, 1)], "B", 0, json!({"from": "B"}), BTreeSet::new())
            .await
            .unwrap();
        let UploadOutcome::Accepted {
            new_ops,
            sync_version,
        } = outcome
        else {
            panic!("expected accept");
        };
        assert_eq!(sync_version, 2);
        assert_eq!(new_ops.len(), 1);
        assert_eq!(new_ops[0].client_id(), "A");
        assert_eq!(new_ops[0].seq(), 10);

        // The stored blob now holds both ops, seq ascending.
        let blob = JsonCodec.decode(&remote.file(PATH).unwrap()).unwrap();
        let seqs: Vec<u64> = blob.recent_ops.iter().map(CompactOp::seq).collect();
        assert_eq!(seqs, vec![1, 10]);
        assert_eq!(blob.last_seq, 10);
        assert_eq!(blob.vector_clock.get("A"), 1);
        assert_eq!(blob.vector_clock.get("B"), 1);
    }

    #[tokio::test]
    async fn upload_writes_backup_of_previous_generation() {
        let remote = Arc::new(MemoryRemote::new());
        let adapter = adapter(remote.clone());

        adapter
            .upload_ops(vec![op("A", 1, 1)], "A", 0, json!({"gen": 1}), BTreeSet::new())
            .await
            .unwrap();
        let first_bytes = remote.file(PATH).unwrap();

        adapter
            .upload_ops(vec![op("A", 2, 2)], "A", 1, json!({"gen": 2}), BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(remote.file(&format!("{PATH}.bak")).unwrap(), first_bytes);
    }

    #[tokio::test]
    async fn window_trim_sets_dropped_watermark_and_truncated_flag() {
        let remote = Arc::new(MemoryRemote::new());
        let adapter = small_window_adapter(remote.clone(), 2);

        adapter
            .upload_ops(
                vec![op("A", 1, 1), op("A", 2, 2), op("A", 3, 3)],
                "A",
                0,
                json!({}),
                BTreeSet::new(),
            )
            .await
            .unwrap();

        let blob = JsonCodec.decode(&remote.file(PATH).unwrap()).unwrap();
        assert_eq!(blob.recent_ops.len(), 2);
        assert_eq!(blob.dropped_through_seq, 1);
        assert_eq!(blob.last_seq, 3);

        // A fresh client (cursor 0) must fall back to the snapshot.
        let outcome = adapter.download_ops(0, "B").await.unwrap();
        assert!(outcome.truncated);

        // A caught-up client does not.
        let outcome = adapter.download_ops(2, "B").await.unwrap();
        assert!(!outcome.truncated);
        assert_eq!(outcome.ops.len(), 1);
    }

    #[tokio::test]
    async fn recent_ops_dedup_by_op_id() {
        let remote = Arc::new(MemoryRemote::new());
        let adapter = adapter(remote.clone());

        let shared = op("A", 5, 1);
        adapter
            .upload_ops(vec![shared.clone()], "A", 0, json!({}), BTreeSet::new())
            .await
            .unwrap();
        adapter
            .upload_ops(vec![shared.clone()], "A", 0, json!({}), BTreeSet::new())
            .await
            .unwrap();

        let blob = JsonCodec.decode(&remote.file(PATH).unwrap()).unwrap();
        assert_eq!(blob.recent_ops.len(), 1);
    }

    #[tokio::test]
    async fn clock_pruning_on_upload_keeps_protected_ids() {
        let remote = Arc::new(MemoryRemote::new());
        let config = SyncConfig {
            max_vector_clock_size: 3,
            ..SyncConfig::default()
        };
        let adapter =
            FileRemoteAdapter::new(remote.clone(), Arc::new(JsonCodec), PATH, config);

        let mut clock = VectorClock::new();
        for i in 0..4 {
            clock.set(format!("peer-{i}"), 100 + i);
        }
        let upload_op = Operation {
            vector_clock: clock,
            ..op("A", 1, 1).into_operation()
        }
        .compact(1);

        let protected: BTreeSet<String> = ["peer-0".to_string()].into();
        adapter
            .upload_ops(vec![upload_op], "A", 0, json!({}), protected)
            .await
            .unwrap();

        let blob = JsonCodec.decode(&remote.file(PATH).unwrap()).unwrap();
        assert!(blob.vector_clock.len() <= 3 + 1);
        assert!(blob.vector_clock.contains("peer-0"));
    }

    #[tokio::test]
    async fn schema_too_new_is_fatal() {
        let remote = Arc::new(MemoryRemote::new());
        let adapter = adapter(remote.clone());
        adapter
            .upload_ops(vec![op("A", 1, 1)], "A", 0, json!({}), BTreeSet::new())
            .await
            .unwrap();

        let old_config = SyncConfig {
            schema_version: 0,
            ..SyncConfig::default()
        };
        let old_client =
            FileRemoteAdapter::new(remote, Arc::new(JsonCodec), PATH, old_config);
        let err = old_client.download_ops(0, "B").await.unwrap_err();
        assert!(matches!(err, SyncError::SchemaTooNew { remote: 1, local: 0 }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn corrupt_blob_refuses_the_cycle() {
        let remote = Arc::new(MemoryRemote::new());
        let adapter = adapter(remote.clone());
        adapter
            .upload_ops(vec![op("A", 1, 1)], "A", 0, json!({}), BTreeSet::new())
            .await
            .unwrap();

        let mut bytes = remote.file(PATH).unwrap();
        let idx = bytes.len() / 2;
        bytes[idx] ^= 0x01;
        remote.put_file(PATH, bytes);

        let err = adapter.download_ops(0, "A").await.unwrap_err();
        assert!(
            matches!(err, SyncError::CorruptBlob { .. } | SyncError::BlobDecode(_)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn snapshot_upload_bumps_version_and_resets_window() {
        let remote = Arc::new(MemoryRemote::new());
        let adapter = small_window_adapter(remote.clone(), 2);
        adapter
            .upload_ops(
                vec![op("A", 1, 1), op("A", 2, 2), op("A", 3, 3)],
                "A",
                0,
                json!({}),
                BTreeSet::new(),
            )
            .await
            .unwrap();

        let import = op("A2", 1, 1);
        let version = adapter
            .upload_snapshot(
                "A2",
                json!({"imported": true}),
                VectorClock::single("A2", 1),
                vec![import],
            )
            .await
            .unwrap();
        assert_eq!(version, 2);

        let blob = JsonCodec.decode(&remote.file(PATH).unwrap()).unwrap();
        assert_eq!(blob.sync_version, 2);
        assert_eq!(blob.dropped_through_seq, 0);
        assert_eq!(blob.recent_ops.len(), 1);
        assert_eq!(blob.state, json!({"imported": true}));
    }

    #[tokio::test]
    async fn expected_sync_version_tracks_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let a = adapter(remote.clone());
        let b = adapter(remote);

        a.upload_ops(vec![op("A", 1, 1)], "A", 0, json!({}), BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(a.expected_sync_version("A"), Some(1));

        b.download_ops(0, "B").await.unwrap();
        assert_eq!(b.expected_sync_version("B"), Some(1));

        a.upload_ops(vec![op("A", 2, 2)], "A", 1, json!({}), BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(a.expected_sync_version("A"), Some(2));

        // B's next upload sees version 2 where it expected 1 and absorbs it.
        b.upload_ops(vec![op("B", 1, 1)], "B", 0, json!({}), BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(b.expected_sync_version("B"), Some(3));
    }
}
