//! The remote sync blob: a single file holding the state snapshot, the
//! recent-ops window, the global vector clock, and the compare-and-swap
//! `sync_version` counter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::clock::VectorClock;
use crate::error::SyncError;
use crate::op::CompactOp;

/// Format marker. Decoders refuse anything newer.
pub const BLOB_FORMAT_VERSION: u32 = 1;

/// The single remote file's contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBlob {
    /// Constant format marker.
    pub version: u32,
    /// Bumped by one on every successful upload; serves as an ETag-less
    /// compare-and-swap token.
    pub sync_version: u64,
    /// Payload schema version of `state` and op payloads.
    pub schema_version: u32,
    /// Global clock known to the uploader at upload time.
    pub vector_clock: VectorClock,
    /// Highest op seq included.
    pub last_seq: u64,
    /// Opaque full state snapshot.
    pub state: Value,
    /// Most recent ops, seq ascending, bounded by the recent-ops window.
    pub recent_ops: Vec<CompactOp>,
    /// Highest seq ever trimmed out of `recent_ops`; clients whose cursor
    /// is at or below this must re-seed from `state`.
    #[serde(default)]
    pub dropped_through_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_young: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_old: Option<Value>,
    /// Hex sha256 over the blob with this field empty.
    pub checksum: String,
    /// Milliseconds since epoch.
    pub last_modified: i64,
}

impl SyncBlob {
    /// An empty first-generation blob.
    pub fn empty(schema_version: u32) -> Self {
        Self {
            version: BLOB_FORMAT_VERSION,
            sync_version: 0,
            schema_version,
            vector_clock: VectorClock::new(),
            last_seq: 0,
            state: Value::Null,
            recent_ops: Vec::new(),
            dropped_through_seq: 0,
            archive_young: None,
            archive_old: None,
            checksum: String::new(),
            last_modified: 0,
        }
    }

    fn checksum_input(&self) -> Result<Vec<u8>, SyncError> {
        let mut unsealed = self.clone();
        unsealed.checksum = String::new();
        Ok(serde_json::to_vec(&unsealed)?)
    }

    pub fn compute_checksum(&self) -> Result<String, SyncError> {
        Ok(hex::encode(Sha256::digest(self.checksum_input()?)))
    }

    /// Stamp the checksum field.
    pub fn seal(mut self) -> Result<Self, SyncError> {
        self.checksum = self.compute_checksum()?;
        Ok(self)
    }

    pub fn verify_checksum(&self) -> Result<(), SyncError> {
        let expected = self.compute_checksum()?;
        if expected != self.checksum {
            return Err(SyncError::CorruptBlob {
                expected,
                actual: self.checksum.clone(),
            });
        }
        Ok(())
    }
}

/// Encode/decode hook for the remote blob. Compression and encryption
/// live behind this seam; the adapter is codec-agnostic.
pub trait BlobCodec: Send + Sync {
    fn encode(&self, blob: &SyncBlob) -> Result<Vec<u8>, SyncError>;
    fn decode(&self, bytes: &[u8]) -> Result<SyncBlob, SyncError>;
}

/// Plain JSON codec; the blob's bit-level stable baseline format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl BlobCodec for JsonCodec {
    fn encode(&self, blob: &SyncBlob) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(blob)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<SyncBlob, SyncError> {
        let blob: SyncBlob = serde_json::from_slice(bytes)
            .map_err(|e| SyncError::BlobDecode(e.to_string()))?;
        if blob.version > BLOB_FORMAT_VERSION {
            return Err(SyncError::UnknownBlobFormat {
                found: blob.version,
                supported: BLOB_FORMAT_VERSION,
            });
        }
        blob.verify_checksum()?;
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{generate_op_id, EntityKind, OpDraft};
    use serde_json::json;

    fn sample() -> SyncBlob {
        let op = OpDraft::update(EntityKind::Task, "t1", json!({"title": "x"}))
            .at(1000)
            .into_operation(generate_op_id(), "A", VectorClock::single("A", 2));
        SyncBlob {
            sync_version: 5,
            schema_version: 1,
            vector_clock: VectorClock::single("A", 2),
            last_seq: 10,
            state: json!({"tasks": {"t1": {"title": "x"}}}),
            recent_ops: vec![op.compact(10)],
            last_modified: 1234,
            ..SyncBlob::empty(1)
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let codec = JsonCodec;
        let blob = sample().seal().unwrap();
        let bytes = codec.encode(&blob).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn checksum_detects_tampering() {
        let codec = JsonCodec;
        let blob = sample().seal().unwrap();
        let mut bytes = codec.encode(&blob).unwrap();
        // Flip the state contents without touching the checksum.
        let tampered = String::from_utf8(bytes.clone())
            .unwrap()
            .replace(r#""title":"x""#, r#""title":"y""#);
        bytes = tampered.into_bytes();
        let err = codec.decode(&bytes).unwrap_err();
        assert!(matches!(err, SyncError::CorruptBlob { .. }));
    }

    #[test]
    fn unsealed_blob_fails_verification() {
        let blob = sample();
        assert!(blob.verify_checksum().is_err());
    }

    #[test]
    fn newer_format_marker_is_refused() {
        let codec = JsonCodec;
        let mut blob = sample();
        blob.version = BLOB_FORMAT_VERSION + 1;
        let blob = blob.seal().unwrap();
        let bytes = serde_json::to_vec(&blob).unwrap();
        let err = codec.decode(&bytes).unwrap_err();
        assert!(matches!(err, SyncError::UnknownBlobFormat { .. }));
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        let err = JsonCodec.decode(b"not json").unwrap_err();
        assert!(matches!(err, SyncError::BlobDecode(_)));
    }
}
