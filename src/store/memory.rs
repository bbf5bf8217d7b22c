//! In-memory op-log store.
//!
//! Interior mutability via `parking_lot::Mutex`; uncontended locks are
//! near-zero overhead. Doubles as the test fake and as the store for
//! ephemeral deployments.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::error::StoreError;
use crate::op::Operation;

use super::traits::{LogEntry, OpLogStore, OpSource, StateCache, StoreResult};

#[derive(Default)]
struct Inner {
    entries: Vec<LogEntry>,
    /// High-water mark for seq assignment; survives rejection but not
    /// `clear_all_operations`.
    max_seq: u64,
    clock: VectorClock,
    protected: BTreeSet<String>,
    client_id: Option<String>,
    cache: Option<StateCache>,
    cache_backup: Option<StateCache>,
    meta: std::collections::HashMap<String, String>,
}

/// In-memory `OpLogStore`.
#[derive(Default)]
pub struct MemoryOpLogStore {
    inner: Mutex<Inner>,
}

impl MemoryOpLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OpLogStore for MemoryOpLogStore {
    fn append(&self, op: &Operation, source: OpSource) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.max_seq + 1;
        inner.max_seq = seq;
        inner.entries.push(LogEntry {
            seq,
            source,
            rejected: false,
            op: op.clone(),
        });
        Ok(seq)
    }

    fn append_with_clock_update(&self, op: &Operation, source: OpSource) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.max_seq + 1;
        inner.max_seq = seq;
        inner.entries.push(LogEntry {
            seq,
            source,
            rejected: false,
            op: op.clone(),
        });
        inner.clock.merge(&op.vector_clock);
        Ok(seq)
    }

    fn scan(
        &self,
        from_seq: u64,
        limit: Option<usize>,
        include_rejected: bool,
    ) -> StoreResult<Vec<LogEntry>> {
        let inner = self.inner.lock();
        let mut out: Vec<LogEntry> = inner
            .entries
            .iter()
            .filter(|e| e.seq >= from_seq && (include_rejected || !e.rejected))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.seq);
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn find_op(&self, op_id: &Uuid) -> StoreResult<Option<LogEntry>> {
        let inner = self.inner.lock();
        Ok(inner.entries.iter().find(|e| e.op.id == *op_id).cloned())
    }

    fn mark_rejected(&self, op_ids: &[Uuid]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        for entry in inner.entries.iter_mut() {
            if op_ids.contains(&entry.op.id) {
                entry.rejected = true;
            }
        }
        Ok(())
    }

    fn get_last_seq(&self) -> StoreResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .iter()
            .filter(|e| !e.rejected)
            .map(|e| e.seq)
            .max()
            .unwrap_or(0))
    }

    fn get_current_vector_clock(&self) -> StoreResult<VectorClock> {
        Ok(self.inner.lock().clock.clone())
    }

    fn set_vector_clock(&self, clock: &VectorClock) -> StoreResult<()> {
        self.inner.lock().clock = clock.clone();
        Ok(())
    }

    fn get_protected_client_ids(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.inner.lock().protected.clone())
    }

    fn set_protected_client_ids(&self, ids: &BTreeSet<String>) -> StoreResult<()> {
        self.inner.lock().protected = ids.clone();
        Ok(())
    }

    fn get_client_id(&self) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().client_id.clone())
    }

    fn set_client_id(&self, client_id: &str) -> StoreResult<()> {
        self.inner.lock().client_id = Some(client_id.to_string());
        Ok(())
    }

    fn load_state_cache(&self) -> StoreResult<Option<StateCache>> {
        Ok(self.inner.lock().cache.clone())
    }

    fn save_state_cache(&self, cache: &StateCache) -> StoreResult<()> {
        self.inner.lock().cache = Some(cache.clone());
        Ok(())
    }

    fn save_state_cache_backup(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.cache_backup = inner.cache.clone();
        Ok(())
    }

    fn restore_state_cache_from_backup(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        match inner.cache_backup.clone() {
            Some(backup) => {
                inner.cache = Some(backup);
                Ok(())
            }
            None => Err(StoreError::NoStateCacheBackup),
        }
    }

    fn clear_state_cache_backup(&self) -> StoreResult<()> {
        self.inner.lock().cache_backup = None;
        Ok(())
    }

    fn clear_state_cache(&self) -> StoreResult<()> {
        self.inner.lock().cache = None;
        Ok(())
    }

    fn clear_all_operations(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.max_seq = 0;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().meta.get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testsuite;

    #[test]
    fn store_contract() {
        testsuite::exercise_store(&MemoryOpLogStore::new());
    }

    #[test]
    fn seq_not_reused_after_rejection() {
        let store = MemoryOpLogStore::new();
        let op = testsuite::op("a", 1);
        let s1 = store.append(&op, OpSource::Local).unwrap();
        store.mark_rejected(&[op.id]).unwrap();
        let s2 = store
            .append(&testsuite::op("a", 2), OpSource::Local)
            .unwrap();
        assert_eq!(s2, s1 + 1);
    }
}
