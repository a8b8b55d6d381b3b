//! Durable, encrypted record persistence.
//!
//! The store is the single source of truth for indexed records. It is
//! mutated only by the index builder and the event synchronizer; the cache
//! and the search engine read from it. Every multi-row commit is one
//! SQLite transaction, so interruption can never leave a partial page.

mod pool;
mod schema;

use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{BuildCursor, BuildProgress, SearchCursor};

pub use pool::{DbConnection, DbPool};
pub use schema::SCHEMA_VERSION;

mod flag_keys {
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const EVENT_CURSOR: &str = "event_cursor";
    pub const BUILD_DONE: &str = "build_done";
    pub const BUILD_TOTAL: &str = "build_total";
    pub const BUILD_CURSOR: &str = "build_cursor";
    pub const ENABLED: &str = "enabled";
    pub const PAUSED: &str = "paused";
    pub const INDEXING_DONE: &str = "indexing_done";
}

/// A record as persisted: ordering metadata in the clear, content sealed
/// under the index key.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedRecord {
    pub id: String,
    pub order: u64,
    pub time: i64,
    pub content: Vec<u8>,
    /// Set when the server payload could not be decrypted at indexing
    /// time; such records carry placeholder content until a repair pass
    /// succeeds.
    pub decrypt_failed: bool,
}

/// One store mutation of an event batch, applied in stream order.
#[derive(Debug, Clone)]
pub enum StoreMutation {
    Upsert(SealedRecord),
    Delete(String),
}

pub struct Store {
    pool: DbPool,
    /// Range-scan statements executed; lets tests assert the sort-only
    /// fast path does no I/O.
    scan_reads: AtomicU64,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let pool = pool::create_pool(db_path)?;
        Self::from_pool(pool)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let pool = pool::create_memory_pool()?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            scan_reads: AtomicU64::new(0),
        };

        {
            let conn = store.connection()?;
            schema::initialize_schema(&conn)?;
        }

        match store.get_flag(flag_keys::SCHEMA_VERSION)? {
            Some(version) if version == SCHEMA_VERSION.to_string() => {}
            Some(version) => {
                warn!(
                    "Schema version mismatch ({} stored, {} expected), wiping index",
                    version, SCHEMA_VERSION
                );
                store.wipe()?;
            }
            None => {
                store.set_flag(flag_keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
            }
        }

        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Verify the flags namespace is present and readable. Failure here is
    /// fatal to the session; the only recovery is `wipe` plus a rebuild.
    pub fn self_check(&self) -> Result<(), StoreError> {
        let version = self
            .get_flag(flag_keys::SCHEMA_VERSION)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        match version {
            Some(_) => Ok(()),
            None => Err(StoreError::Corrupt("schema version flag missing".into())),
        }
    }

    // -----------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------

    /// Commit one build page atomically together with its progress and
    /// resume cursor. Either the whole page becomes durable or none of it.
    pub fn put_page(
        &self,
        records: &[SealedRecord],
        progress: &BuildProgress,
        cursor: Option<&BuildCursor>,
    ) -> Result<(), StoreError> {
        let conn = self.connection()?;
        let tx = conn.unchecked_transaction()?;

        let now = chrono::Utc::now().timestamp_millis();
        for record in records {
            tx.execute(
                "INSERT OR REPLACE INTO records
                    (id, order_key, time, content, decrypt_failed, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.order as i64,
                    record.time,
                    record.content,
                    record.decrypt_failed as i32,
                    now,
                ],
            )?;
        }

        set_flag_tx(&tx, flag_keys::BUILD_DONE, &progress.records_done.to_string())?;
        set_flag_tx(
            &tx,
            flag_keys::BUILD_TOTAL,
            &progress.records_total.to_string(),
        )?;
        if let Some(cursor) = cursor {
            set_flag_tx(&tx, flag_keys::BUILD_CURSOR, &serde_json::to_string(cursor)?)?;
        }

        tx.commit()?;
        debug!("Committed page of {} records", records.len());
        Ok(())
    }

    pub fn upsert_record(&self, record: &SealedRecord) -> Result<(), StoreError> {
        let conn = self.connection()?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO records
                (id, order_key, time, content, decrypt_failed, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.order as i64,
                record.time,
                record.content,
                record.decrypt_failed as i32,
                now,
            ],
        )?;
        Ok(())
    }

    /// Apply one event batch's mutations in stream order within a single
    /// transaction. Replay converges: upserts are keyed by ID and deletes
    /// of absent rows are no-ops.
    pub fn apply_mutations(&self, mutations: &[StoreMutation]) -> Result<(), StoreError> {
        let conn = self.connection()?;
        let tx = conn.unchecked_transaction()?;

        let now = chrono::Utc::now().timestamp_millis();
        for mutation in mutations {
            match mutation {
                StoreMutation::Upsert(record) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO records
                            (id, order_key, time, content, decrypt_failed, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            record.id,
                            record.order as i64,
                            record.time,
                            record.content,
                            record.decrypt_failed as i32,
                            now,
                        ],
                    )?;
                }
                StoreMutation::Delete(id) => {
                    tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove records untouched since `cutoff_ms`. Used by a full refresh
    /// to drop rows the server no longer has: everything the refresh saw
    /// was rewritten with a newer timestamp.
    pub fn delete_updated_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let conn = self.connection()?;
        let deleted = conn.execute(
            "DELETE FROM records WHERE updated_at < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted as u64)
    }

    /// Returns whether a row was actually removed; deleting an absent
    /// record is a no-op, which keeps event replay idempotent.
    pub fn delete_record(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let deleted = conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn get_record(&self, id: &str) -> Result<Option<SealedRecord>, StoreError> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                "SELECT id, order_key, time, content, decrypt_failed
                 FROM records WHERE id = ?1",
                params![id],
                row_to_sealed,
            )
            .optional()?;
        Ok(record)
    }

    /// Range scan strictly backward in time from `before` (newest first
    /// when `before` is `None`), at most `limit` records.
    pub fn scan_before(
        &self,
        before: Option<SearchCursor>,
        limit: usize,
    ) -> Result<Vec<SealedRecord>, StoreError> {
        self.scan_reads.fetch_add(1, Ordering::SeqCst);
        let conn = self.connection()?;

        let mut records = Vec::new();
        match before {
            Some(cursor) => {
                let mut stmt = conn.prepare(
                    "SELECT id, order_key, time, content, decrypt_failed
                     FROM records
                     WHERE time < ?1 OR (time = ?1 AND order_key < ?2)
                     ORDER BY time DESC, order_key DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![cursor.time, cursor.order as i64, limit as i64],
                    row_to_sealed,
                )?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, order_key, time, content, decrypt_failed
                     FROM records
                     ORDER BY time DESC, order_key DESC
                     LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_to_sealed)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }

        Ok(records)
    }

    pub fn count_records(&self) -> Result<u64, StoreError> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn all_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id FROM records")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn decrypt_failed_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id FROM records WHERE decrypt_failed = 1")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn count_decrypt_failed(&self) -> Result<u64, StoreError> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE decrypt_failed = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Number of range-scan statements executed so far.
    pub fn scan_reads(&self) -> u64 {
        self.scan_reads.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------
    // Flags
    // -----------------------------------------------------------------

    pub fn get_flag(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM flags WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_flag(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO flags (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove_flag(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM flags WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn get_bool_flag(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get_flag(key)?.as_deref() == Some("1"))
    }

    fn set_bool_flag(&self, key: &str, value: bool) -> Result<(), StoreError> {
        if value {
            self.set_flag(key, "1")
        } else {
            self.remove_flag(key)
        }
    }

    pub fn event_cursor(&self) -> Result<Option<String>, StoreError> {
        self.get_flag(flag_keys::EVENT_CURSOR)
    }

    pub fn set_event_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        self.set_flag(flag_keys::EVENT_CURSOR, cursor)
    }

    pub fn build_progress(&self) -> Result<Option<BuildProgress>, StoreError> {
        let done = self.get_flag(flag_keys::BUILD_DONE)?;
        let total = self.get_flag(flag_keys::BUILD_TOTAL)?;
        match (done, total) {
            (Some(done), Some(total)) => {
                let records_done = done
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("bad build_done flag: {}", done)))?;
                let records_total = total
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("bad build_total flag: {}", total)))?;
                Ok(Some(BuildProgress {
                    records_done,
                    records_total,
                }))
            }
            _ => Ok(None),
        }
    }

    pub fn set_build_progress(&self, progress: &BuildProgress) -> Result<(), StoreError> {
        self.set_flag(flag_keys::BUILD_DONE, &progress.records_done.to_string())?;
        self.set_flag(flag_keys::BUILD_TOTAL, &progress.records_total.to_string())
    }

    pub fn build_cursor(&self) -> Result<Option<BuildCursor>, StoreError> {
        match self.get_flag(flag_keys::BUILD_CURSOR)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn clear_build_cursor(&self) -> Result<(), StoreError> {
        self.remove_flag(flag_keys::BUILD_CURSOR)
    }

    /// Forget progress and resume cursor so the next build re-walks the
    /// corpus from the newest record (full refresh).
    pub fn clear_build_state(&self) -> Result<(), StoreError> {
        self.remove_flag(flag_keys::BUILD_DONE)?;
        self.remove_flag(flag_keys::BUILD_TOTAL)?;
        self.remove_flag(flag_keys::BUILD_CURSOR)
    }

    pub fn enabled(&self) -> Result<bool, StoreError> {
        self.get_bool_flag(flag_keys::ENABLED)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.set_bool_flag(flag_keys::ENABLED, enabled)
    }

    pub fn paused(&self) -> Result<bool, StoreError> {
        self.get_bool_flag(flag_keys::PAUSED)
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), StoreError> {
        self.set_bool_flag(flag_keys::PAUSED, paused)
    }

    pub fn indexing_done(&self) -> Result<bool, StoreError> {
        self.get_bool_flag(flag_keys::INDEXING_DONE)
    }

    pub fn set_indexing_done(&self, done: bool) -> Result<(), StoreError> {
        self.set_bool_flag(flag_keys::INDEXING_DONE, done)
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Delete all durable state. The schema version flag is re-seeded so
    /// the store stays usable for a fresh build.
    pub fn wipe(&self) -> Result<(), StoreError> {
        info!("Wiping encrypted search index");
        let conn = self.connection()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM flags", [])?;
        set_flag_tx(&tx, flag_keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
        tx.commit()?;
        Ok(())
    }
}

fn set_flag_tx(
    tx: &rusqlite::Transaction<'_>,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR REPLACE INTO flags (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn row_to_sealed(row: &rusqlite::Row<'_>) -> Result<SealedRecord, rusqlite::Error> {
    Ok(SealedRecord {
        id: row.get(0)?,
        order: row.get::<_, i64>(1)? as u64,
        time: row.get(2)?,
        content: row.get(3)?,
        decrypt_failed: row.get::<_, i32>(4)? != 0,
    })
}
