//! Shared sync-state store
//!
//! One record per (file, backend) holds the [`SyncState`] and the lock that
//! serializes modifications. Every process sharing a backend must see the
//! same records, so the store sits outside process memory: the shipped
//! implementation is a SQLite database (`.dataprov/state.db`) opened by
//! every participant, with all compare-and-set steps inside
//! `BEGIN IMMEDIATE` transactions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::domain::{BackendId, FileId, SyncKey, SyncRecord, SyncState};
use crate::error::Result;

/// How a lock holder leaves the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Write `state`; `synced` also stamps `synced_at`
    Commit { state: SyncState, synced: bool },
    /// Remove the record (back to `NoCache`)
    Destroy,
}

/// Atomically updatable record store shared by every participant
pub trait StateStore: Send + Sync {
    fn get(&self, key: SyncKey) -> Result<Option<SyncRecord>>;

    /// Takes the lock if it is free or expired. An expired holder's
    /// `Syncing*` state is invalidated first. Returns the record as the new
    /// holder sees it, or `None` while someone else holds a live lock.
    fn try_acquire(&self, key: SyncKey, holder: &str, ttl: Duration) -> Result<Option<SyncRecord>>;

    /// Changes the state under a held lock; false if the lock was lost
    fn set_locked_state(&self, key: SyncKey, holder: &str, state: SyncState) -> Result<bool>;

    /// Writes the outcome and frees the lock; false if the lock was lost
    fn release(&self, key: SyncKey, holder: &str, release: Release) -> Result<bool>;

    /// Invalidates a `Syncing*` state whose lock has expired. Returns the
    /// new state if anything changed.
    fn reset_stale(&self, key: SyncKey) -> Result<Option<SyncState>>;

    fn records_for_backend(&self, backend_id: BackendId) -> Result<Vec<SyncRecord>>;
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// SQLite-backed [`StateStore`]
pub struct SqliteStateStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Schema version - bump when the schema changes
    const SCHEMA_VERSION: i32 = 1;

    /// Wait this long for another writer before failing with SQLITE_BUSY
    const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

    /// Opens (or creates) the store at `db_path`
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Self::BUSY_TIMEOUT)?;

        // WAL lets readers proceed while a transition commits
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            db_path,
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version == Self::SCHEMA_VERSION {
            return Ok(());
        }

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_status (
                file_id INTEGER NOT NULL,
                backend_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                lock_holder TEXT,
                lock_expires_at INTEGER,
                updated_at INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL,
                synced_at INTEGER,
                PRIMARY KEY (file_id, backend_id)
            );

            CREATE INDEX IF NOT EXISTS idx_sync_backend ON sync_status(backend_id);
            ",
        )?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", Self::SCHEMA_VERSION))?;

        Ok(())
    }

    fn read_record(conn: &Connection, key: SyncKey) -> rusqlite::Result<Option<SyncRecord>> {
        conn.query_row(
            "SELECT file_id, backend_id, state, lock_holder, lock_expires_at,
                    updated_at, accessed_at, synced_at
             FROM sync_status WHERE file_id = ?1 AND backend_id = ?2",
            params![key.file_id.get() as i64, key.backend_id.get()],
            Self::row_to_record,
        )
        .optional()
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRecord> {
        let state: String = row.get(2)?;
        let state = state.parse::<SyncState>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?;

        Ok(SyncRecord {
            file_id: FileId::new(row.get::<_, i64>(0)? as u64),
            backend_id: BackendId::new(row.get(1)?),
            state,
            lock_holder: row.get(3)?,
            lock_expires_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
            updated_at: from_millis(row.get(5)?),
            accessed_at: from_millis(row.get(6)?),
            synced_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        })
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: SyncKey) -> Result<Option<SyncRecord>> {
        let conn = self.conn.lock();
        Ok(Self::read_record(&conn, key)?)
    }

    fn try_acquire(&self, key: SyncKey, holder: &str, ttl: Duration) -> Result<Option<SyncRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = Utc::now();
        let now_ms = to_millis(now);

        tx.execute(
            "INSERT OR IGNORE INTO sync_status (file_id, backend_id, state, updated_at, accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                key.file_id.get() as i64,
                key.backend_id.get(),
                SyncState::NoCache.as_str(),
                now_ms
            ],
        )?;

        let Some(record) = Self::read_record(&tx, key)? else {
            return Ok(None);
        };

        if record.is_locked_at(now) {
            return Ok(None);
        }

        let state = if record.has_stale_lock_at(now) {
            let recovered = record.state.after_interruption();
            tracing::warn!(
                key = %key,
                stale_holder = record.lock_holder.as_deref().unwrap_or_default(),
                from = %record.state,
                to = %recovered,
                "Stealing expired sync lock"
            );
            recovered
        } else {
            record.state
        };

        let expires = now + chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64);
        tx.execute(
            "UPDATE sync_status
             SET state = ?3, lock_holder = ?4, lock_expires_at = ?5, updated_at = ?6
             WHERE file_id = ?1 AND backend_id = ?2",
            params![
                key.file_id.get() as i64,
                key.backend_id.get(),
                state.as_str(),
                holder,
                to_millis(expires),
                now_ms
            ],
        )?;
        tx.commit()?;

        Ok(Some(SyncRecord {
            state,
            lock_holder: Some(holder.to_string()),
            lock_expires_at: Some(expires),
            updated_at: now,
            ..record
        }))
    }

    fn set_locked_state(&self, key: SyncKey, holder: &str, state: SyncState) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sync_status SET state = ?4, updated_at = ?5
             WHERE file_id = ?1 AND backend_id = ?2 AND lock_holder = ?3",
            params![
                key.file_id.get() as i64,
                key.backend_id.get(),
                holder,
                state.as_str(),
                to_millis(Utc::now())
            ],
        )?;
        Ok(changed == 1)
    }

    fn release(&self, key: SyncKey, holder: &str, release: Release) -> Result<bool> {
        let conn = self.conn.lock();
        let now_ms = to_millis(Utc::now());

        let changed = match release {
            Release::Destroy => conn.execute(
                "DELETE FROM sync_status
                 WHERE file_id = ?1 AND backend_id = ?2 AND lock_holder = ?3",
                params![key.file_id.get() as i64, key.backend_id.get(), holder],
            )?,
            Release::Commit { state, synced } => conn.execute(
                "UPDATE sync_status
                 SET state = ?4, lock_holder = NULL, lock_expires_at = NULL,
                     updated_at = ?5, accessed_at = ?5,
                     synced_at = CASE WHEN ?6 THEN ?5 ELSE synced_at END
                 WHERE file_id = ?1 AND backend_id = ?2 AND lock_holder = ?3",
                params![
                    key.file_id.get() as i64,
                    key.backend_id.get(),
                    holder,
                    state.as_str(),
                    now_ms,
                    synced
                ],
            )?,
        };

        Ok(changed == 1)
    }

    fn reset_stale(&self, key: SyncKey) -> Result<Option<SyncState>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let Some(record) = Self::read_record(&tx, key)? else {
            return Ok(None);
        };

        if record.is_locked_at(now) || !record.state.is_syncing() {
            return Ok(None);
        }

        let recovered = record.state.after_interruption();
        tx.execute(
            "UPDATE sync_status
             SET state = ?3, lock_holder = NULL, lock_expires_at = NULL, updated_at = ?4
             WHERE file_id = ?1 AND backend_id = ?2",
            params![
                key.file_id.get() as i64,
                key.backend_id.get(),
                recovered.as_str(),
                to_millis(now)
            ],
        )?;
        tx.commit()?;

        Ok(Some(recovered))
    }

    fn records_for_backend(&self, backend_id: BackendId) -> Result<Vec<SyncRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_id, backend_id, state, lock_holder, lock_expires_at,
                    updated_at, accessed_at, synced_at
             FROM sync_status WHERE backend_id = ?1 ORDER BY file_id",
        )?;

        let records = stmt
            .query_map(params![backend_id.get()], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60);

    fn key(file: u64) -> SyncKey {
        SyncKey::new(FileId::new(file), BackendId::new(1))
    }

    fn open(dir: &TempDir) -> SqliteStateStore {
        SqliteStateStore::open(dir.path().join("state.db")).unwrap()
    }

    #[test]
    fn missing_record_is_none() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.get(key(1)).unwrap().is_none());
    }

    #[test]
    fn acquire_creates_no_cache_record() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let record = store.try_acquire(key(1), "me", TTL).unwrap().unwrap();
        assert_eq!(record.state, SyncState::NoCache);
        assert_eq!(record.lock_holder.as_deref(), Some("me"));

        let stored = store.get(key(1)).unwrap().unwrap();
        assert!(stored.is_locked_at(Utc::now()));
    }

    #[test]
    fn live_lock_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let first = open(&dir);
        let second = open(&dir);

        assert!(first.try_acquire(key(1), "a", TTL).unwrap().is_some());
        assert!(second.try_acquire(key(1), "b", TTL).unwrap().is_none());

        // Other files are independent
        assert!(second.try_acquire(key(2), "b", TTL).unwrap().is_some());

        assert!(first
            .release(key(1), "a", Release::Commit { state: SyncState::InSync, synced: true })
            .unwrap());
        let record = second.try_acquire(key(1), "b", TTL).unwrap().unwrap();
        assert_eq!(record.state, SyncState::InSync);
        assert!(record.synced_at.is_some());
    }

    #[test]
    fn release_by_non_holder_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.try_acquire(key(1), "a", TTL).unwrap();
        assert!(!store
            .release(key(1), "intruder", Release::Destroy)
            .unwrap());
        assert!(!store
            .set_locked_state(key(1), "intruder", SyncState::InSync)
            .unwrap());
        assert!(store.get(key(1)).unwrap().is_some());
    }

    #[test]
    fn expired_lock_is_stolen_and_state_invalidated() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.try_acquire(key(1), "crashed", Duration::from_millis(1)).unwrap();
        assert!(store
            .set_locked_state(key(1), "crashed", SyncState::SyncingToCache)
            .unwrap());
        std::thread::sleep(Duration::from_millis(20));

        let record = store.try_acquire(key(1), "next", TTL).unwrap().unwrap();
        assert_eq!(record.state, SyncState::ProviderNewer);
        assert_eq!(record.lock_holder.as_deref(), Some("next"));

        // The crashed holder can no longer commit
        assert!(!store
            .release(key(1), "crashed", Release::Commit { state: SyncState::InSync, synced: true })
            .unwrap());
    }

    #[test]
    fn destroy_removes_record() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.try_acquire(key(3), "a", TTL).unwrap();
        assert!(store.release(key(3), "a", Release::Destroy).unwrap());
        assert!(store.get(key(3)).unwrap().is_none());
    }

    #[test]
    fn reset_stale_only_touches_expired_transfers() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.try_acquire(key(1), "live", TTL).unwrap();
        store.set_locked_state(key(1), "live", SyncState::SyncingToProvider).unwrap();
        assert_eq!(store.reset_stale(key(1)).unwrap(), None);

        store.try_acquire(key(2), "dead", Duration::from_millis(1)).unwrap();
        store.set_locked_state(key(2), "dead", SyncState::SyncingToProvider).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(store.reset_stale(key(2)).unwrap(), Some(SyncState::CacheNewer));
        assert_eq!(store.reset_stale(key(2)).unwrap(), None);
    }

    #[test]
    fn records_for_backend_filters() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.try_acquire(key(1), "a", TTL).unwrap();
        store.try_acquire(key(2), "a", TTL).unwrap();
        store
            .try_acquire(SyncKey::new(FileId::new(1), BackendId::new(9)), "a", TTL)
            .unwrap();

        let records = store.records_for_backend(BackendId::new(1)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file_id, FileId::new(1));
    }

    #[test]
    fn reopening_keeps_schema_and_data() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store.try_acquire(key(1), "a", TTL).unwrap();
            store
                .release(key(1), "a", Release::Commit { state: SyncState::CacheNewer, synced: false })
                .unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.get(key(1)).unwrap().unwrap().state, SyncState::CacheNewer);
    }
}
