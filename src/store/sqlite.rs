//! SQLite-backed op-log store.
//!
//! One `ops` table for the log and one `meta` key/value table for the
//! global clock, protected ids, client id, state cache, and cursors.
//! The single `Connection` is serialized behind a mutex, which also makes
//! the read-max/insert seq assignment atomic.

use std::collections::BTreeSet;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::error::StoreError;
use crate::op::Operation;

use super::traits::{LogEntry, OpLogStore, OpSource, StateCache, StoreResult};

const META_VECTOR_CLOCK: &str = "vector_clock";
const META_PROTECTED_IDS: &str = "protected_client_ids";
const META_CLIENT_ID: &str = "client_id";
const META_STATE_CACHE: &str = "state_cache";
const META_STATE_CACHE_BACKUP: &str = "state_cache_backup";

/// `OpLogStore` over a SQLite database.
pub struct SqliteOpLogStore {
    conn: Mutex<Connection>,
}

impl SqliteOpLogStore {
    /// Open (and initialize) a database file. WAL keeps concurrent readers
    /// cheap for the surrounding application.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ops (
                seq       INTEGER PRIMARY KEY,
                op_id     TEXT NOT NULL UNIQUE,
                client_id TEXT NOT NULL,
                source    TEXT NOT NULL CHECK(source IN ('local','remote')),
                rejected  INTEGER NOT NULL DEFAULT 0,
                op_json   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ops_rejected ON ops(rejected, seq);

            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_meta(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
                r.get::<_, String>(0)
            })
            .optional()?)
    }

    fn write_meta(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO meta(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_meta(conn: &Connection, key: &str) -> StoreResult<()> {
        conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn insert(&self, op: &Operation, source: OpSource, update_clock: bool) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let next: u64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM ops",
            [],
            |r| r.get(0),
        )?;
        let source_str = match source {
            OpSource::Local => "local",
            OpSource::Remote => "remote",
        };
        conn.execute(
            "INSERT INTO ops(seq, op_id, client_id, source, rejected, op_json)
             VALUES(?1, ?2, ?3, ?4, 0, ?5)",
            params![
                next,
                op.id.to_string(),
                op.client_id,
                source_str,
                serde_json::to_string(op)?
            ],
        )?;
        if update_clock {
            let mut clock = match Self::read_meta(&conn, META_VECTOR_CLOCK)? {
                Some(json) => serde_json::from_str(&json)?,
                None => VectorClock::new(),
            };
            clock.merge(&op.vector_clock);
            Self::write_meta(&conn, META_VECTOR_CLOCK, &serde_json::to_string(&clock)?)?;
        }
        Ok(next)
    }

    fn row_to_entry(
        seq: u64,
        source: String,
        rejected: bool,
        op_json: String,
    ) -> StoreResult<LogEntry> {
        let op: Operation = serde_json::from_str(&op_json)?;
        let source = if source == "local" {
            OpSource::Local
        } else {
            OpSource::Remote
        };
        Ok(LogEntry {
            seq,
            source,
            rejected,
            op,
        })
    }
}

impl OpLogStore for SqliteOpLogStore {
    fn append(&self, op: &Operation, source: OpSource) -> StoreResult<u64> {
        self.insert(op, source, false)
    }

    fn append_with_clock_update(&self, op: &Operation, source: OpSource) -> StoreResult<u64> {
        self.insert(op, source, true)
    }

    fn scan(
        &self,
        from_seq: u64,
        limit: Option<usize>,
        include_rejected: bool,
    ) -> StoreResult<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, source, rejected, op_json FROM ops
             WHERE seq >= ?1 AND (?2 OR rejected = 0)
             ORDER BY seq ASC
             LIMIT ?3",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![from_seq, include_rejected, limit], |r| {
            Ok((
                r.get::<_, u64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, bool>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, source, rejected, op_json) = row?;
            out.push(Self::row_to_entry(seq, source, rejected, op_json)?);
        }
        Ok(out)
    }

    fn find_op(&self, op_id: &Uuid) -> StoreResult<Option<LogEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT seq, source, rejected, op_json FROM ops WHERE op_id = ?1",
                params![op_id.to_string()],
                |r| {
                    Ok((
                        r.get::<_, u64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, bool>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((seq, source, rejected, op_json)) => {
                Ok(Some(Self::row_to_entry(seq, source, rejected, op_json)?))
            }
            None => Ok(None),
        }
    }

    fn mark_rejected(&self, op_ids: &[Uuid]) -> StoreResult<()> {
        let conn = self.conn.lock();
        for id in op_ids {
            conn.execute(
                "UPDATE ops SET rejected = 1 WHERE op_id = ?1",
                params![id.to_string()],
            )?;
        }
        Ok(())
    }

    fn get_last_seq(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM ops WHERE rejected = 0",
            [],
            |r| r.get(0),
        )?)
    }

    fn get_current_vector_clock(&self) -> StoreResult<VectorClock> {
        let conn = self.conn.lock();
        match Self::read_meta(&conn, META_VECTOR_CLOCK)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(VectorClock::new()),
        }
    }

    fn set_vector_clock(&self, clock: &VectorClock) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::write_meta(&conn, META_VECTOR_CLOCK, &serde_json::to_string(clock)?)
    }

    fn get_protected_client_ids(&self) -> StoreResult<BTreeSet<String>> {
        let conn = self.conn.lock();
        match Self::read_meta(&conn, META_PROTECTED_IDS)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(BTreeSet::new()),
        }
    }

    fn set_protected_client_ids(&self, ids: &BTreeSet<String>) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::write_meta(&conn, META_PROTECTED_IDS, &serde_json::to_string(ids)?)
    }

    fn get_client_id(&self) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        Self::read_meta(&conn, META_CLIENT_ID)
    }

    fn set_client_id(&self, client_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::write_meta(&conn, META_CLIENT_ID, client_id)
    }

    fn load_state_cache(&self) -> StoreResult<Option<StateCache>> {
        let conn = self.conn.lock();
        match Self::read_meta(&conn, META_STATE_CACHE)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save_state_cache(&self, cache: &StateCache) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::write_meta(&conn, META_STATE_CACHE, &serde_json::to_string(cache)?)
    }

    fn save_state_cache_backup(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        match Self::read_meta(&conn, META_STATE_CACHE)? {
            Some(json) => Self::write_meta(&conn, META_STATE_CACHE_BACKUP, &json),
            None => Self::delete_meta(&conn, META_STATE_CACHE_BACKUP),
        }
    }

    fn restore_state_cache_from_backup(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        match Self::read_meta(&conn, META_STATE_CACHE_BACKUP)? {
            Some(json) => Self::write_meta(&conn, META_STATE_CACHE, &json),
            None => Err(StoreError::NoStateCacheBackup),
        }
    }

    fn clear_state_cache_backup(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::delete_meta(&conn, META_STATE_CACHE_BACKUP)
    }

    fn clear_state_cache(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::delete_meta(&conn, META_STATE_CACHE)
    }

    fn clear_all_operations(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM ops", [])?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        Self::read_meta(&conn, key)
    }

    fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::write_meta(&conn, key, value)
    }
}
