//! Storage contract for the operation log.
//!
//! Narrow sync-only interface: the surrounding application owns its own
//! document storage; this trait covers only what the sync core needs.
//! Implementations are synchronous — callers using them from async
//! contexts should be aware that these calls block the current thread.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::error::StoreError;
use crate::op::Operation;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Where an op entered the local log from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpSource {
    Local,
    Remote,
}

/// Stored form of an operation: the op plus local-only metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic per-store sequence, never reused.
    pub seq: u64,
    pub source: OpSource,
    /// Add-only tombstone: a rejected op never produces state effects but
    /// stays visible to the superseded-op rewriter until cleanup.
    pub rejected: bool,
    pub op: Operation,
}

/// Serialized materialized state plus bookkeeping. Exists solely to speed
/// up cold starts; regenerated from the log, never a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateCache {
    pub state: Value,
    pub last_applied_op_seq: u64,
    pub vector_clock: VectorClock,
    /// Milliseconds since epoch.
    pub compacted_at: i64,
    pub schema_version: u32,
    /// Convenience index of entity keys present in the snapshot. Never
    /// read for correctness.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot_entity_keys: Vec<String>,
}

/// Append-only operation log with rejection tombstones, the persisted
/// global vector clock, the pruning-safe protected-client-id set, and the
/// snapshot cache lifecycle.
pub trait OpLogStore: Send + Sync {
    /// Atomically assign `seq = max(existing seqs) + 1`, persist, return seq.
    fn append(&self, op: &Operation, source: OpSource) -> StoreResult<u64>;

    /// Append and advance the global clock to `merge(global, op.vector_clock)`.
    ///
    /// Callers must hold the log's single-writer section so that concurrent
    /// append sequences cannot interleave between reading the clock and
    /// appending with the new one.
    fn append_with_clock_update(&self, op: &Operation, source: OpSource) -> StoreResult<u64>;

    /// Entries with `seq >= from_seq`, ordered by seq ascending. Rejected
    /// entries are skipped unless `include_rejected`.
    fn scan(
        &self,
        from_seq: u64,
        limit: Option<usize>,
        include_rejected: bool,
    ) -> StoreResult<Vec<LogEntry>>;

    /// Look up an entry by op id (rejected entries included).
    fn find_op(&self, op_id: &Uuid) -> StoreResult<Option<LogEntry>>;

    /// Idempotent tombstoning. Unknown ids are ignored.
    fn mark_rejected(&self, op_ids: &[Uuid]) -> StoreResult<()>;

    /// Largest non-rejected seq, 0 when none.
    fn get_last_seq(&self) -> StoreResult<u64>;

    fn get_current_vector_clock(&self) -> StoreResult<VectorClock>;

    /// Overwrite the global clock (clean slate and post-import paths).
    fn set_vector_clock(&self, clock: &VectorClock) -> StoreResult<()>;

    fn get_protected_client_ids(&self) -> StoreResult<BTreeSet<String>>;

    /// Overwrite semantics; this set must never be shrunk implicitly.
    fn set_protected_client_ids(&self, ids: &BTreeSet<String>) -> StoreResult<()>;

    fn get_client_id(&self) -> StoreResult<Option<String>>;

    fn set_client_id(&self, client_id: &str) -> StoreResult<()>;

    fn load_state_cache(&self) -> StoreResult<Option<StateCache>>;

    /// Overwrite the cache in place.
    fn save_state_cache(&self, cache: &StateCache) -> StoreResult<()>;

    /// Copy the current cache into the single backup slot.
    fn save_state_cache_backup(&self) -> StoreResult<()>;

    /// Replace the cache with the backup. `NoStateCacheBackup` if empty.
    fn restore_state_cache_from_backup(&self) -> StoreResult<()>;

    fn clear_state_cache_backup(&self) -> StoreResult<()>;

    fn clear_state_cache(&self) -> StoreResult<()>;

    /// Remove all entries and reset seq numbering. Never touches the
    /// protected-client-id set; callers reset that explicitly if needed.
    fn clear_all_operations(&self) -> StoreResult<()>;

    /// Free-form metadata (sync cursors and similar small values).
    fn get_meta(&self, key: &str) -> StoreResult<Option<String>>;

    fn set_meta(&self, key: &str, value: &str) -> StoreResult<()>;
}
