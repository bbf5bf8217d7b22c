//! Conflict resolution between two operations on the same entity.
//!
//! Vector clocks decide when they can; otherwise Last-Writer-Wins over
//! the (timestamp, client id, op id) tuple. The tie-break is total and
//! deterministic — every client must pick the same winner.

use serde_json::Value;

use crate::clock::ClockOrdering;
use crate::error::Result;
use crate::op::{EntityKind, OpType, Operation};

/// Which side of a conflict survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// Provides the current materialized entity state for rewrite payloads.
/// Implemented by the surrounding application.
pub trait EntityStateProvider: Send + Sync {
    fn current_entity_state(&self, kind: EntityKind, entity_id: &str) -> Result<Option<Value>>;
}

/// Decide the winner between a local and a remote op on the same entity.
pub fn decide(local: &Operation, remote: &Operation) -> ConflictWinner {
    match local.vector_clock.compare(&remote.vector_clock) {
        ClockOrdering::Greater => ConflictWinner::Local,
        ClockOrdering::Less => ConflictWinner::Remote,
        ClockOrdering::Equal | ClockOrdering::Concurrent => last_writer_wins(local, remote),
    }
}

fn last_writer_wins(local: &Operation, remote: &Operation) -> ConflictWinner {
    let local_key = (local.timestamp, local.client_id.as_str(), local.id);
    let remote_key = (remote.timestamp, remote.client_id.as_str(), remote.id);
    if local_key > remote_key {
        ConflictWinner::Local
    } else {
        ConflictWinner::Remote
    }
}

/// Shape of the rewrite op that re-asserts a conflict outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum RewriteAction {
    /// A delete was involved: re-assert the delete verbatim rather than
    /// rewriting against a possibly missing entity.
    PreserveDelete(Operation),
    /// A bulk archive move: action type, `entity_ids` and payload are
    /// preserved verbatim; the bulk op wins or loses as a unit.
    PreserveBulk(Operation),
    /// Regular update: the payload becomes the current materialized
    /// entity state — "this is the post-conflict truth".
    UpdateWithState(Value),
    /// No entity state to rewrite from: the local change is discarded
    /// and the user notified.
    Discard,
}

/// Pick the rewrite shape for a group of superseded local ops.
///
/// `locals` are the superseded ops (same entity, or same kind for bulk
/// ops); `remote` is the conflicting remote op when the caller knows it.
pub fn rewrite_action(
    locals: &[&Operation],
    remote: Option<&Operation>,
    state: &dyn EntityStateProvider,
) -> Result<RewriteAction> {
    // Either side being a delete wins over payload rewriting.
    if let Some(delete) = locals.iter().find(|op| op.op_type == OpType::Delete) {
        return Ok(RewriteAction::PreserveDelete((*delete).clone()));
    }
    if let Some(remote) = remote {
        if remote.op_type == OpType::Delete {
            return Ok(RewriteAction::PreserveDelete(remote.clone()));
        }
    }

    if let Some(bulk) = locals.iter().rev().find(|op| op.is_bulk()) {
        return Ok(RewriteAction::PreserveBulk((*bulk).clone()));
    }

    let Some(last) = locals.last() else {
        return Ok(RewriteAction::Discard);
    };
    let Some(entity_id) = last.entity_id.as_deref() else {
        return Ok(RewriteAction::Discard);
    };
    match state.current_entity_state(last.entity_kind, entity_id)? {
        Some(current) => Ok(RewriteAction::UpdateWithState(current)),
        None => Ok(RewriteAction::Discard),
    }
}
