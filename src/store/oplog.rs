//! `OpLog` — the shared handle to the op-log store plus the single-writer
//! critical section.
//!
//! Any sequence that reads the global vector clock, appends ops, and
//! advances the clock must run inside `write_section` so concurrent
//! appenders cannot interleave between "read clock" and "append with new
//! clock".

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::VectorClock;
use crate::error::{Result, SyncError};
use crate::op::{generate_client_id, generate_op_id, OpDraft, OpType, Operation};

use super::traits::{LogEntry, OpLogStore, OpSource, StateCache};

/// Shared handle to an op-log store.
#[derive(Clone)]
pub struct OpLog {
    store: Arc<dyn OpLogStore>,
    write_lock: Arc<Mutex<()>>,
    max_clock_size: usize,
}

impl OpLog {
    pub fn new(store: Arc<dyn OpLogStore>, max_clock_size: usize) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
            max_clock_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn OpLogStore> {
        &self.store
    }

    /// Run `f` inside the single-writer critical section.
    ///
    /// The closure must not block on I/O other than the store itself.
    pub fn write_section<T>(&self, f: impl FnOnce(&dyn OpLogStore) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        f(self.store.as_ref())
    }

    /// The local client id, failing on write paths where it is required.
    pub fn client_id(&self) -> Result<String> {
        self.store
            .get_client_id()?
            .ok_or(SyncError::MissingClientId)
    }

    /// The local client id, generated and persisted on first use.
    pub fn ensure_client_id(&self) -> Result<String> {
        if let Some(id) = self.store.get_client_id()? {
            return Ok(id);
        }
        let id = generate_client_id();
        self.store.set_client_id(&id)?;
        info!(client_id = %id, "assigned new client id");
        Ok(id)
    }

    /// Append a locally produced op: stamp it with the next causal clock
    /// (merge-and-increment over the global clock, then size-limited) and
    /// advance the global clock.
    ///
    /// A `SyncImport` op additionally records its full clock key set in
    /// the protected-client-id set so pruning never drops those ids.
    pub fn append_local(&self, draft: OpDraft) -> Result<LogEntry> {
        self.write_section(|store| {
            let client_id = store.get_client_id()?.ok_or(SyncError::MissingClientId)?;
            let global = store.get_current_vector_clock()?;
            let protected = store.get_protected_client_ids()?;

            let clock = VectorClock::merge_and_increment([&global], &client_id)
                .limit_size(self.max_clock_size, &protected, &client_id);

            let op = draft.into_operation(generate_op_id(), client_id.clone(), clock);
            let seq = store.append_with_clock_update(&op, OpSource::Local)?;

            if op.op_type == OpType::SyncImport {
                let mut protected = protected;
                protected.extend(op.vector_clock.keys().map(str::to_string));
                store.set_protected_client_ids(&protected)?;
            }

            debug!(seq, op_id = %op.id, "appended local op");
            Ok(LogEntry {
                seq,
                source: OpSource::Local,
                rejected: false,
                op,
            })
        })
    }

    /// Append remote ops received from the sync remote, skipping ops the
    /// log already holds (idempotent re-application after a cancelled
    /// round).
    pub fn append_remote(&self, ops: &[Operation]) -> Result<usize> {
        self.write_section(|store| {
            let mut appended = 0;
            for op in ops {
                if store.find_op(&op.id)?.is_some() {
                    continue;
                }
                store.append_with_clock_update(op, OpSource::Remote)?;
                appended += 1;
            }
            Ok(appended)
        })
    }

    /// Non-rejected locally produced entries with `seq > after_seq`.
    pub fn pending_local_ops(&self, after_seq: u64) -> Result<Vec<LogEntry>> {
        let entries = self.store.scan(after_seq + 1, None, false)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.source == OpSource::Local)
            .collect())
    }

    /// The most recent `SyncImport` op in the log, local or remote.
    pub fn latest_sync_import(&self) -> Result<Option<Operation>> {
        let entries = self.store.scan(0, None, false)?;
        Ok(entries
            .into_iter()
            .rev()
            .find(|e| e.op.op_type == OpType::SyncImport)
            .map(|e| e.op))
    }

    /// Start over under a fresh identity: append one `SyncImport` carrying
    /// the full current state, drop all prior log entries, and protect
    /// every client id the old clock knew about so later pruning cannot
    /// break causality for peers that still reference them.
    ///
    /// Returns the new client id and the import op (already appended).
    pub fn clean_slate(&self, state: Value, schema_version: u32) -> Result<(String, Operation)> {
        self.write_section(|store| {
            let old_clock = store.get_current_vector_clock()?;
            let new_client_id = generate_client_id();

            store.clear_all_operations()?;
            store.set_client_id(&new_client_id)?;

            let import_clock = VectorClock::single(new_client_id.clone(), 1);
            let op = OpDraft::sync_import(state)
                .schema_version(schema_version)
                .into_operation(generate_op_id(), new_client_id.clone(), import_clock.clone());
            store.append(&op, OpSource::Local)?;

            let mut new_clock = old_clock.clone();
            new_clock.merge(&import_clock);
            store.set_vector_clock(&new_clock)?;

            let mut protected: BTreeSet<String> =
                old_clock.keys().map(str::to_string).collect();
            protected.insert(new_client_id.clone());
            store.set_protected_client_ids(&protected)?;

            info!(client_id = %new_client_id, "created clean slate");
            Ok((new_client_id, op))
        })
    }

    /// Migrate the snapshot cache through `f` with backup-then-replace
    /// semantics. On migration failure the backup is restored; if the
    /// restore also fails, the cache is cleared so the next cold start
    /// rebuilds from the log, and the combined error is reported.
    pub fn migrate_state_cache(
        &self,
        f: impl FnOnce(StateCache) -> Result<StateCache>,
    ) -> Result<()> {
        let Some(cache) = self.store.load_state_cache()? else {
            return Ok(());
        };
        self.store.save_state_cache_backup()?;

        match f(cache) {
            Ok(migrated) => {
                self.store.save_state_cache(&migrated)?;
                self.store.clear_state_cache_backup()?;
                Ok(())
            }
            Err(migrate_err) => match self.store.restore_state_cache_from_backup() {
                Ok(()) => {
                    warn!(error = %migrate_err, "state cache migration failed; backup restored");
                    Err(migrate_err)
                }
                Err(restore_err) => {
                    self.store.clear_state_cache()?;
                    self.store.clear_state_cache_backup()?;
                    Err(SyncError::StateCacheRecovery {
                        migrate: migrate_err.to_string(),
                        restore: restore_err.to_string(),
                    })
                }
            },
        }
    }
}
