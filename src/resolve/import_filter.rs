//! Sync-import filter.
//!
//! After a SYNC_IMPORT, any queued local op whose clock does not strictly
//! dominate the import's clock is causally pre-import and must not be
//! uploaded; it would re-introduce state the import replaced. Clock
//! pruning can make legitimate post-import ops look concurrent with the
//! import, so a heuristic rescues those.

use crate::clock::{ClockOrdering, VectorClock};
use crate::op::Operation;
use crate::store::LogEntry;

/// Split of pending local ops into uploadable and pre-import ones.
#[derive(Debug, Default)]
pub struct ImportPartition {
    pub valid: Vec<LogEntry>,
    /// Causally pre-import; callers tombstone these and notify the user.
    pub invalidated: Vec<LogEntry>,
}

/// Partition pending local ops against the most recent sync import.
/// Without an import everything is valid.
pub fn partition_after_import(
    ops: Vec<LogEntry>,
    import: Option<&Operation>,
    max_clock_size: usize,
) -> ImportPartition {
    let Some(import) = import else {
        return ImportPartition {
            valid: ops,
            invalidated: Vec::new(),
        };
    };

    let mut partition = ImportPartition::default();
    for entry in ops {
        if entry.op.id == import.id {
            // The import itself is always uploadable.
            partition.valid.push(entry);
        } else if is_pre_import(&entry.op, import, max_clock_size) {
            partition.invalidated.push(entry);
        } else {
            partition.valid.push(entry);
        }
    }
    partition
}

/// Whether `op` is causally pre-import relative to `import`.
pub fn is_pre_import(op: &Operation, import: &Operation, max_clock_size: usize) -> bool {
    match op.vector_clock.compare(&import.vector_clock) {
        ClockOrdering::Greater => false,
        ClockOrdering::Less | ClockOrdering::Equal => true,
        ClockOrdering::Concurrent => !is_likely_pruning_artifact(
            &op.vector_clock,
            &op.client_id,
            &import.vector_clock,
            max_clock_size,
        ),
    }
}

/// Heuristic for Concurrent comparisons that are really a pruning
/// artifact: a post-import client whose clock was size-limited on upload
/// no longer strictly dominates the import clock.
///
/// Conservative on every branch — any evidence of genuine concurrency
/// classifies the op as pre-import.
pub fn is_likely_pruning_artifact(
    op_clock: &VectorClock,
    op_client_id: &str,
    import_clock: &VectorClock,
    max_clock_size: usize,
) -> bool {
    // The import already knew this client: genuinely concurrent.
    if import_clock.contains(op_client_id) {
        return false;
    }
    // An unpruned import clock cannot explain a spurious Concurrent.
    if import_clock.len() < max_clock_size {
        return false;
    }
    // No overlap at all: unrelated histories.
    let shared: Vec<&str> = op_clock
        .keys()
        .filter(|k| import_clock.contains(k))
        .collect();
    if shared.is_empty() {
        return false;
    }
    // Post-import clocks inherited the import's counters; every shared
    // counter must be at least the import's.
    shared
        .iter()
        .all(|k| op_clock.get(k) >= import_clock.get(k))
}
