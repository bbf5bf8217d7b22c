//! Sync-specific types: the remote trait, the applier and provider
//! traits the surrounding application implements, and the result /
//! notice data structures for a sync round.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::op::{CompactOp, Operation};
use crate::resolve::EntityStateProvider;
use crate::store::OpLog;

// ============================================================================
// SyncRemote — the op-level remote interface
// ============================================================================

/// Remote endpoint for op synchronization. The single-file adapter is the
/// canonical implementation; an HTTP sync service is another.
#[async_trait]
pub trait SyncRemote: Send + Sync {
    /// Fetch peer ops with seq beyond `since_seq`, plus remote metadata.
    async fn download_ops(&self, since_seq: u64, client_id: &str) -> Result<DownloadOutcome>;

    /// Upload local ops. `last_known_seq` is the highest peer seq this
    /// client has already applied; ops beyond it come back piggybacked.
    /// `state` is the uploader's current materialized snapshot and
    /// `protected` the pruning-safe client-id set.
    async fn upload_ops(
        &self,
        ops: Vec<CompactOp>,
        client_id: &str,
        last_known_seq: u64,
        state: Value,
        protected: BTreeSet<String>,
    ) -> Result<UploadOutcome>;

    /// Force-overwrite the remote with a snapshot, bypassing piggyback.
    /// Used after clean slate, import, or an encryption change. Returns
    /// the new sync version.
    async fn upload_snapshot(
        &self,
        client_id: &str,
        state: Value,
        vector_clock: VectorClock,
        recent_ops: Vec<CompactOp>,
    ) -> Result<u64>;
}

/// Result of `download_ops`.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Peer ops newer than the cursor, seq ascending.
    pub ops: Vec<CompactOp>,
    /// Highest op seq the remote has (its `last_seq`).
    pub latest_seq: u64,
    /// Remote's global vector clock.
    pub vector_clock: VectorClock,
    pub sync_version: u64,
    pub schema_version: u32,
    /// Remote state snapshot, for the window-overrun fallback.
    pub state: Value,
    /// The recent-ops window no longer covers this client's cursor; it
    /// must re-seed from `state` instead of replaying individual ops.
    pub truncated: bool,
}

impl DownloadOutcome {
    /// Outcome for a remote that has never been written.
    pub fn empty(schema_version: u32) -> Self {
        Self {
            ops: Vec::new(),
            latest_seq: 0,
            vector_clock: VectorClock::new(),
            sync_version: 0,
            schema_version,
            state: Value::Null,
            truncated: false,
        }
    }
}

/// Tagged result of `upload_ops` — no exception-driven control flow on
/// the upload path.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// Upload landed. Version skew was absorbed: `new_ops` are peer ops
    /// that reached the remote while we were offline, already merged into
    /// the uploaded blob, returned for local application.
    Accepted {
        new_ops: Vec<CompactOp>,
        sync_version: u64,
    },
    /// The server refused specific ops that lost a causal race.
    Rejected { ops: Vec<RejectedOp> },
}

/// Server-reported rejection of one op.
#[derive(Debug, Clone)]
pub struct RejectedOp {
    pub op_id: Uuid,
    /// Clock of the newer server-side op that beat it, when reported.
    pub existing_clock: Option<VectorClock>,
}

// ============================================================================
// Application-side hooks
// ============================================================================

/// Applies remote ops to the materialized application state. Must be
/// idempotent and ordering-preserving; a cancelled round replays the same
/// ops on the next round.
pub trait OpApplier: Send + Sync {
    fn apply_remote_ops(&self, ops: &[Operation]) -> Result<()>;

    /// Replace the materialized state wholesale (window overrun, imports).
    fn apply_full_state(&self, state: &Value) -> Result<()>;
}

/// Supplies the full materialized snapshot for uploads.
pub trait SnapshotProvider: Send + Sync {
    fn current_state(&self) -> Result<Value>;
}

// ============================================================================
// Notices and round results
// ============================================================================

/// User-visible sync events, surfaced through the notice callback in
/// place of any particular UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// Conflict rewriting kept `kept` local changes and discarded
    /// `discarded` that had no surviving entity state.
    ChangesRewritten { kept: usize, discarded: usize },
    /// Queued local ops predating a sync import were dropped.
    PreImportOpsDropped { count: usize },
}

pub type NoticeCallback = Arc<dyn Fn(&SyncNotice) + Send + Sync>;

/// Phase of the orchestrator's round state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Pulling,
    Applying,
    Pushing,
    Resolving,
    Error,
}

/// Counters for one completed sync round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Peer ops received in the pull step.
    pub pulled: usize,
    /// Peer ops received piggybacked on the upload.
    pub piggybacked: usize,
    /// Local ops uploaded.
    pub pushed: usize,
    /// Rewrite ops produced by conflict resolution.
    pub rewritten: usize,
    /// Local changes discarded during conflict resolution.
    pub discarded: usize,
    /// Pre-import local ops dropped.
    pub dropped_pre_import: usize,
    /// Whether the round re-seeded from the full remote snapshot.
    pub applied_full_state: bool,
    /// Remote sync version after the round, when known.
    pub sync_version: Option<u64>,
}

/// Everything the orchestrator needs, passed explicitly — narrow
/// dependencies as constructor parameters, no service graph.
pub struct SyncOrchestratorOptions {
    pub log: OpLog,
    pub remote: Arc<dyn SyncRemote>,
    pub applier: Arc<dyn OpApplier>,
    pub entity_state: Arc<dyn EntityStateProvider>,
    pub snapshot: Arc<dyn SnapshotProvider>,
    pub config: SyncConfig,
    /// Called for each user-visible sync event.
    pub on_notice: Option<NoticeCallback>,
}
