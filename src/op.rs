//! The operation model: immutable records describing intended state
//! changes, plus the compact wire form stored in the remote blob.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::VectorClock;

// ============================================================================
// Ids
// ============================================================================

/// Generate a time-ordered operation id. v7 keeps the final LWW tie-break
/// (largest op id wins) stable with respect to wall-clock order.
pub fn generate_op_id() -> Uuid {
    Uuid::now_v7()
}

/// Generate an opaque client id: a short random string, unique per device.
pub fn generate_client_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

// ============================================================================
// Operation
// ============================================================================

/// Kind of state change an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Create,
    Update,
    Delete,
    /// Full-state import. The payload is a complete application snapshot
    /// and invalidates all causally earlier ops.
    SyncImport,
}

/// Entity namespace an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Task,
    Project,
    Tag,
    Note,
    /// Bulk scope: the whole dataset (imports).
    All,
}

impl EntityKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EntityKind::Task => "TASK",
            EntityKind::Project => "PROJECT",
            EntityKind::Tag => "TAG",
            EntityKind::Note => "NOTE",
            EntityKind::All => "ALL",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// An immutable record describing one intended state change.
///
/// The payload is opaque to the sync core except for `SyncImport`, whose
/// payload is a full application state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    /// Producing client.
    pub client_id: String,
    /// Opaque action tag, e.g. `[TASK] Update`.
    pub action_type: String,
    pub op_type: OpType,
    pub entity_kind: EntityKind,
    /// Primary entity affected; absent for bulk ops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Additional affected entities (archive moves).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
    pub payload: Value,
    /// Causal stamp. Invariant: `vector_clock[client_id] >= 1`, strictly
    /// increasing across ops appended by the same client.
    pub vector_clock: VectorClock,
    /// Milliseconds since epoch; used only for LWW tie-break.
    pub timestamp: i64,
    pub schema_version: u32,
}

impl Operation {
    /// A bulk `Update` carrying `entity_ids` (archive moves). Bulk ops win
    /// or lose conflicts as a unit and keep their payload verbatim.
    pub fn is_bulk(&self) -> bool {
        self.op_type == OpType::Update && self.entity_ids.is_some()
    }

    pub fn compact(&self, seq: u64) -> CompactOp {
        CompactOp::new(seq, self.clone())
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// OpDraft — an operation before the log stamps identity and causality
// ============================================================================

/// Everything the application decides about an op. The log fills in the
/// producing client, the vector clock, and the id at append time.
#[derive(Debug, Clone)]
pub struct OpDraft {
    pub action_type: String,
    pub op_type: OpType,
    pub entity_kind: EntityKind,
    pub entity_id: Option<String>,
    pub entity_ids: Option<Vec<String>>,
    pub payload: Value,
    pub timestamp: i64,
    pub schema_version: u32,
}

impl OpDraft {
    pub fn create(kind: EntityKind, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: format!("[{kind}] Create"),
            op_type: OpType::Create,
            entity_kind: kind,
            entity_id: Some(entity_id.into()),
            entity_ids: None,
            payload,
            timestamp: now_ms(),
            schema_version: 1,
        }
    }

    pub fn update(kind: EntityKind, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: format!("[{kind}] Update"),
            op_type: OpType::Update,
            entity_kind: kind,
            entity_id: Some(entity_id.into()),
            entity_ids: None,
            payload,
            timestamp: now_ms(),
            schema_version: 1,
        }
    }

    /// Deletes carry a full-enough payload to re-execute intent on a peer.
    pub fn delete(kind: EntityKind, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: format!("[{kind}] Delete"),
            op_type: OpType::Delete,
            entity_kind: kind,
            entity_id: Some(entity_id.into()),
            entity_ids: None,
            payload,
            timestamp: now_ms(),
            schema_version: 1,
        }
    }

    /// Bulk archive move: affected entities ride in `entity_ids` and the
    /// payload is preserved verbatim through conflict rewrites.
    pub fn move_to_archive(kind: EntityKind, entity_ids: Vec<String>, payload: Value) -> Self {
        Self {
            action_type: format!("[{kind}] Move to archive"),
            op_type: OpType::Update,
            entity_kind: kind,
            entity_id: None,
            entity_ids: Some(entity_ids),
            payload,
            timestamp: now_ms(),
            schema_version: 1,
        }
    }

    /// Full-state import. The payload is the complete application state.
    pub fn sync_import(state: Value) -> Self {
        Self {
            action_type: "[ALL] Load(import) all data".to_string(),
            op_type: OpType::SyncImport,
            entity_kind: EntityKind::All,
            entity_id: None,
            entity_ids: None,
            payload: state,
            timestamp: now_ms(),
            schema_version: 1,
        }
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = timestamp_ms;
        self
    }

    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Materialize into an `Operation` with log-assigned identity.
    pub fn into_operation(
        self,
        id: Uuid,
        client_id: impl Into<String>,
        vector_clock: VectorClock,
    ) -> Operation {
        Operation {
            id,
            client_id: client_id.into(),
            action_type: self.action_type,
            op_type: self.op_type,
            entity_kind: self.entity_kind,
            entity_id: self.entity_id,
            entity_ids: self.entity_ids,
            payload: self.payload,
            vector_clock,
            timestamp: self.timestamp,
            schema_version: self.schema_version,
        }
    }
}

// ============================================================================
// CompactOp — wire form for the remote blob
// ============================================================================

/// Compact form of an operation as carried in the remote blob's
/// `recent_ops` window: short field names plus the producer-local seq.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactOp {
    /// Producer-local log sequence.
    pub s: u64,
    pub id: Uuid,
    /// Client id.
    pub c: String,
    /// Action tag.
    pub a: String,
    /// Op type.
    pub o: OpType,
    /// Entity kind.
    pub e: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eids: Option<Vec<String>>,
    /// Payload.
    pub p: Value,
    /// Vector clock.
    pub vc: VectorClock,
    /// Timestamp (ms since epoch).
    pub t: i64,
    /// Payload schema version.
    pub v: u32,
}

impl CompactOp {
    pub fn new(seq: u64, op: Operation) -> Self {
        Self {
            s: seq,
            id: op.id,
            c: op.client_id,
            a: op.action_type,
            o: op.op_type,
            e: op.entity_kind,
            eid: op.entity_id,
            eids: op.entity_ids,
            p: op.payload,
            vc: op.vector_clock,
            t: op.timestamp,
            v: op.schema_version,
        }
    }

    pub fn seq(&self) -> u64 {
        self.s
    }

    pub fn client_id(&self) -> &str {
        &self.c
    }

    pub fn into_operation(self) -> Operation {
        Operation {
            id: self.id,
            client_id: self.c,
            action_type: self.a,
            op_type: self.o,
            entity_kind: self.e,
            entity_id: self.eid,
            entity_ids: self.eids,
            payload: self.p,
            vector_clock: self.vc,
            timestamp: self.t,
            schema_version: self.v,
        }
    }
}
