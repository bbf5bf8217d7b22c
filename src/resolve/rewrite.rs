//! Superseded-op rewriter.
//!
//! Local ops that lost a causal race are tombstoned and, where possible,
//! re-asserted as fresh ops whose clock dominates everything the server
//! reported. The rewrite keeps the user's timestamp so LWW ordering still
//! reflects their intent.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::error::Result;
use crate::op::{generate_op_id, EntityKind, OpType, Operation};
use crate::store::{OpLog, OpSource};

use super::conflict::{rewrite_action, EntityStateProvider, RewriteAction};

/// A local op the server saw as superseded, plus the server-reported
/// clock of whatever newer op beat it. `remote` is the conflicting remote
/// op itself when the caller could locate it in the log.
#[derive(Debug, Clone)]
pub struct SupersededOp {
    pub op_id: Uuid,
    pub op: Operation,
    pub existing_clock: Option<VectorClock>,
    pub remote: Option<Operation>,
}

/// Result of a rewrite pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// Rewrite ops appended to the log.
    pub rewritten: usize,
    /// Input ops whose intent could not be re-asserted.
    pub discarded: usize,
    /// Every input op id (all are tombstoned).
    pub rejected_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Entity(EntityKind, String),
    /// Bulk ops group by kind; they win or lose as a unit.
    Bulk(EntityKind),
}

fn group_key(op: &Operation) -> GroupKey {
    match (&op.entity_id, op.is_bulk()) {
        (Some(id), false) => GroupKey::Entity(op.entity_kind, id.clone()),
        _ => GroupKey::Bulk(op.entity_kind),
    }
}

/// Batch-rewrite superseded local ops into new LWW ops.
pub struct SupersededRewriter<'a> {
    log: &'a OpLog,
    entity_state: &'a dyn EntityStateProvider,
    max_clock_size: usize,
}

impl<'a> SupersededRewriter<'a> {
    pub fn new(
        log: &'a OpLog,
        entity_state: &'a dyn EntityStateProvider,
        max_clock_size: usize,
    ) -> Self {
        Self {
            log,
            entity_state,
            max_clock_size,
        }
    }

    /// Tombstone every input and append one rewrite op per entity group.
    ///
    /// `extra_clocks` and `snapshot_clock` are folded into every rewrite's
    /// merged clock so the result dominates the server-side causality too.
    pub fn rewrite_superseded(
        &self,
        inputs: Vec<SupersededOp>,
        extra_clocks: &[VectorClock],
        snapshot_clock: Option<&VectorClock>,
    ) -> Result<RewriteOutcome> {
        if inputs.is_empty() {
            return Ok(RewriteOutcome::default());
        }

        self.log.write_section(|store| {
            let Some(client_id) = store.get_client_id()? else {
                warn!("no local client id; aborting with zero rewrites");
                return Ok(RewriteOutcome::default());
            };

            let rejected_ids: Vec<Uuid> = inputs.iter().map(|i| i.op_id).collect();
            store.mark_rejected(&rejected_ids)?;

            let mut groups: BTreeMap<GroupKey, Vec<&SupersededOp>> = BTreeMap::new();
            for input in &inputs {
                groups.entry(group_key(&input.op)).or_default().push(input);
            }

            let protected = store.get_protected_client_ids()?;
            let mut outcome = RewriteOutcome {
                rejected_ids,
                ..Default::default()
            };

            for (key, group) in groups {
                let Some(template) = group.last().map(|i| i.op.clone()) else {
                    continue;
                };
                // Re-read per group: each appended rewrite advances the
                // global clock, and the next rewrite's increment must
                // stay strictly above it.
                let global = store.get_current_vector_clock()?;

                let mut merged = global;
                if let Some(snapshot_clock) = snapshot_clock {
                    merged.merge(snapshot_clock);
                }
                for extra in extra_clocks {
                    merged.merge(extra);
                }
                let mut protection = protected.clone();
                for input in &group {
                    merged.merge(&input.op.vector_clock);
                    if let Some(existing) = &input.existing_clock {
                        merged.merge(existing);
                        // Server-observed causality must survive pruning.
                        protection.extend(existing.keys().map(str::to_string));
                    }
                }
                merged.increment(&client_id);
                let rewrite_clock =
                    merged.limit_size(self.max_clock_size, &protection, &client_id);

                // Never now(): the max input timestamp preserves LWW
                // ordering with the user's original intent.
                let rewrite_ts = group.iter().map(|i| i.op.timestamp).max().unwrap_or(0);
                let schema_version =
                    group.iter().map(|i| i.op.schema_version).max().unwrap_or(1);

                let locals: Vec<&Operation> = group.iter().map(|i| &i.op).collect();
                let remote = group.iter().rev().find_map(|i| i.remote.as_ref());
                let action = rewrite_action(&locals, remote, self.entity_state)?;

                let rewrite = match action {
                    RewriteAction::PreserveDelete(delete) => Operation {
                        id: generate_op_id(),
                        client_id: client_id.clone(),
                        action_type: delete.action_type.clone(),
                        op_type: OpType::Delete,
                        entity_kind: delete.entity_kind,
                        entity_id: delete.entity_id.clone(),
                        entity_ids: delete.entity_ids.clone(),
                        payload: delete.payload.clone(),
                        vector_clock: rewrite_clock,
                        timestamp: rewrite_ts,
                        schema_version,
                    },
                    RewriteAction::PreserveBulk(bulk) => Operation {
                        id: generate_op_id(),
                        client_id: client_id.clone(),
                        action_type: bulk.action_type.clone(),
                        op_type: OpType::Update,
                        entity_kind: bulk.entity_kind,
                        entity_id: bulk.entity_id.clone(),
                        entity_ids: bulk.entity_ids.clone(),
                        payload: bulk.payload.clone(),
                        vector_clock: rewrite_clock,
                        timestamp: rewrite_ts,
                        schema_version,
                    },
                    RewriteAction::UpdateWithState(state) => Operation {
                        id: generate_op_id(),
                        client_id: client_id.clone(),
                        action_type: format!("[{}] Update (LWW)", template.entity_kind),
                        op_type: OpType::Update,
                        entity_kind: template.entity_kind,
                        entity_id: template.entity_id.clone(),
                        entity_ids: None,
                        payload: state,
                        vector_clock: rewrite_clock,
                        timestamp: rewrite_ts,
                        schema_version,
                    },
                    RewriteAction::Discard => {
                        debug!(?key, dropped = group.len(), "no entity state; group discarded");
                        outcome.discarded += group.len();
                        continue;
                    }
                };

                store.append_with_clock_update(&rewrite, OpSource::Local)?;
                outcome.rewritten += 1;
            }

            debug!(
                rewritten = outcome.rewritten,
                discarded = outcome.discarded,
                "superseded-op rewrite complete"
            );
            Ok(outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockOrdering;
    use crate::op::OpDraft;
    use crate::store::MemoryOpLogStore;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;

    struct MapState(Mutex<HashMap<String, Value>>);

    impl MapState {
        fn new(entries: &[(&str, Value)]) -> Self {
            Self(Mutex::new(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            ))
        }
    }

    impl EntityStateProvider for MapState {
        fn current_entity_state(&self, _: EntityKind, id: &str) -> Result<Option<Value>> {
            Ok(self.0.lock().get(id).cloned())
        }
    }

    fn oplog() -> OpLog {
        let log = OpLog::new(Arc::new(MemoryOpLogStore::new()), 20);
        log.store().set_client_id("A").unwrap();
        log
    }

    fn superseded(log: &OpLog, draft: OpDraft, existing: Option<VectorClock>) -> SupersededOp {
        let entry = log.append_local(draft).unwrap();
        SupersededOp {
            op_id: entry.op.id,
            op: entry.op,
            existing_clock: existing,
            remote: None,
        }
    }

    #[test]
    fn missing_client_id_aborts_with_zero_rewrites() {
        let log = OpLog::new(Arc::new(MemoryOpLogStore::new()), 20);
        let state = MapState::new(&[]);
        let rewriter = SupersededRewriter::new(&log, &state, 20);
        let input = SupersededOp {
            op_id: generate_op_id(),
            op: OpDraft::update(EntityKind::Task, "t1", json!({})).into_operation(
                generate_op_id(),
                "A",
                VectorClock::single("A", 1),
            ),
            existing_clock: None,
            remote: None,
        };
        let outcome = rewriter.rewrite_superseded(vec![input], &[], None).unwrap();
        assert_eq!(outcome, RewriteOutcome::default());
    }

    #[test]
    fn update_rewrite_takes_current_state_and_dominates_server_clock() {
        let log = oplog();
        let state = MapState::new(&[("t1", json!({"title": "truth"}))]);
        let rewriter = SupersededRewriter::new(&log, &state, 20);

        let existing = VectorClock::single("B", 7);
        let input = superseded(
            &log,
            OpDraft::update(EntityKind::Task, "t1", json!({"title": "mine"})).at(1000),
            Some(existing.clone()),
        );
        let input_clock = input.op.vector_clock.clone();

        let outcome = rewriter
            .rewrite_superseded(vec![input], &[], None)
            .unwrap();
        assert_eq!(outcome.rewritten, 1);
        assert_eq!(outcome.discarded, 0);

        let entries = log.store().scan(0, None, false).unwrap();
        let rewrite = &entries.last().unwrap().op;
        assert_eq!(rewrite.payload, json!({"title": "truth"}));
        assert_eq!(rewrite.timestamp, 1000);
        assert_eq!(rewrite.vector_clock.compare(&existing), ClockOrdering::Greater);
        assert_eq!(
            rewrite.vector_clock.compare(&input_clock),
            ClockOrdering::Greater
        );
    }

    #[test]
    fn inputs_are_tombstoned() {
        let log = oplog();
        let state = MapState::new(&[("t1", json!({}))]);
        let rewriter = SupersededRewriter::new(&log, &state, 20);

        let input = superseded(
            &log,
            OpDraft::update(EntityKind::Task, "t1", json!({})),
            None,
        );
        let id = input.op_id;
        let outcome = rewriter.rewrite_superseded(vec![input], &[], None).unwrap();
        assert_eq!(outcome.rejected_ids, vec![id]);
        assert!(log.store().find_op(&id).unwrap().unwrap().rejected);
    }

    #[test]
    fn remote_delete_produces_delete_rewrite() {
        // A local edit lost to a remote delete: the rewrite re-asserts the
        // delete with a clock dominating both sides.
        let log = oplog();
        let state = MapState::new(&[]); // entity is gone locally too
        let rewriter = SupersededRewriter::new(&log, &state, 20);

        let remote_delete = OpDraft::delete(EntityKind::Task, "t1", json!({"id": "t1"}))
            .into_operation(generate_op_id(), "B", VectorClock::single("B", 7));

        let mut input = superseded(
            &log,
            OpDraft::update(EntityKind::Task, "t1", json!({"title": "edited"})).at(1000),
            Some(VectorClock::single("B", 7)),
        );
        input.remote = Some(remote_delete);

        let outcome = rewriter.rewrite_superseded(vec![input], &[], None).unwrap();
        assert_eq!(outcome.rewritten, 1);

        let entries = log.store().scan(0, None, false).unwrap();
        let rewrite = &entries.last().unwrap().op;
        assert_eq!(rewrite.op_type, OpType::Delete);
        assert_eq!(rewrite.timestamp, 1000);
        assert_eq!(rewrite.vector_clock.get("B"), 7);
        assert!(rewrite.vector_clock.get("A") >= 2);
    }

    #[test]
    fn missing_state_discards_group() {
        let log = oplog();
        let state = MapState::new(&[]);
        let rewriter = SupersededRewriter::new(&log, &state, 20);

        let input = superseded(
            &log,
            OpDraft::update(EntityKind::Task, "gone", json!({"title": "x"})),
            None,
        );
        let before = log.store().scan(0, None, false).unwrap().len();
        let outcome = rewriter.rewrite_superseded(vec![input], &[], None).unwrap();
        assert_eq!(outcome.rewritten, 0);
        assert_eq!(outcome.discarded, 1);
        // Tombstoned input, no new op.
        assert_eq!(log.store().scan(0, None, false).unwrap().len(), before - 1);
    }

    #[test]
    fn bulk_archive_rewrite_preserves_payload_and_entity_ids() {
        let log = oplog();
        let state = MapState::new(&[]);
        let rewriter = SupersededRewriter::new(&log, &state, 20);

        let input = superseded(
            &log,
            OpDraft::move_to_archive(
                EntityKind::Task,
                vec!["t1".into(), "t2".into()],
                json!({"archived": ["t1", "t2"]}),
            )
            .at(2000),
            None,
        );
        let outcome = rewriter.rewrite_superseded(vec![input], &[], None).unwrap();
        assert_eq!(outcome.rewritten, 1);

        let entries = log.store().scan(0, None, false).unwrap();
        let rewrite = &entries.last().unwrap().op;
        assert_eq!(rewrite.op_type, OpType::Update);
        assert_eq!(rewrite.action_type, "[TASK] Move to archive");
        assert_eq!(
            rewrite.entity_ids,
            Some(vec!["t1".to_string(), "t2".to_string()])
        );
        assert_eq!(rewrite.payload, json!({"archived": ["t1", "t2"]}));
    }

    #[test]
    fn groups_rewrite_with_strictly_increasing_local_counters() {
        let log = oplog();
        let state = MapState::new(&[("t1", json!({"a": 1})), ("t2", json!({"b": 2}))]);
        let rewriter = SupersededRewriter::new(&log, &state, 20);

        let i1 = superseded(&log, OpDraft::update(EntityKind::Task, "t1", json!({})), None);
        let i2 = superseded(&log, OpDraft::update(EntityKind::Task, "t2", json!({})), None);

        let outcome = rewriter.rewrite_superseded(vec![i1, i2], &[], None).unwrap();
        assert_eq!(outcome.rewritten, 2);

        let entries = log.store().scan(0, None, false).unwrap();
        let rewrites: Vec<_> = entries.iter().rev().take(2).rev().collect();
        assert!(
            rewrites[0].op.vector_clock.get("A") < rewrites[1].op.vector_clock.get("A"),
            "per-client counters must stay strictly increasing across groups"
        );
    }

    #[test]
    fn group_timestamp_is_max_of_inputs() {
        let log = oplog();
        let state = MapState::new(&[("t1", json!({}))]);
        let rewriter = SupersededRewriter::new(&log, &state, 20);

        let i1 = superseded(
            &log,
            OpDraft::update(EntityKind::Task, "t1", json!({"n": 1})).at(500),
            None,
        );
        let i2 = superseded(
            &log,
            OpDraft::update(EntityKind::Task, "t1", json!({"n": 2})).at(900),
            None,
        );
        rewriter.rewrite_superseded(vec![i1, i2], &[], None).unwrap();

        let entries = log.store().scan(0, None, false).unwrap();
        assert_eq!(entries.last().unwrap().op.timestamp, 900);
    }

    #[test]
    fn existing_clock_keys_survive_pruning() {
        // Tight clock budget: the server-observed key must still be kept.
        let log = oplog();
        for i in 0..4 {
            log.append_remote(&[OpDraft::update(EntityKind::Task, "x", json!({}))
                .into_operation(
                    generate_op_id(),
                    format!("peer-{i}"),
                    VectorClock::single(format!("peer-{i}"), 100 + i),
                )])
                .unwrap();
        }
        let state = MapState::new(&[("t1", json!({}))]);
        let rewriter = SupersededRewriter::new(&log, &state, 3);

        let input = superseded(
            &log,
            OpDraft::update(EntityKind::Task, "t1", json!({})),
            Some(VectorClock::single("server-peer", 1)),
        );
        rewriter.rewrite_superseded(vec![input], &[], None).unwrap();

        let entries = log.store().scan(0, None, false).unwrap();
        let rewrite = &entries.last().unwrap().op;
        assert!(rewrite.vector_clock.contains("server-peer"));
        assert!(rewrite.vector_clock.contains("A"));
    }
}
