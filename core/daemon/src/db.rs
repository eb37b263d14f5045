//! SQLite persistence for ticket-timer-daemon.
//!
//! The daemon is the single writer for its database. The schema is one
//! key-value table holding the JSON value of each store key.

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};

use timer_core::{StoreKey, StoreMap};

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_entries(&self, keys: &[StoreKey]) -> Result<StoreMap, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT value FROM kv WHERE key = ?1")
                .map_err(|err| format!("Failed to prepare kv query: {}", err))?;

            let mut entries = StoreMap::new();
            for key in keys {
                let mut rows = stmt
                    .query(params![key.as_str()])
                    .map_err(|err| format!("Failed to query kv row: {}", err))?;
                let Some(row) = rows
                    .next()
                    .map_err(|err| format!("Failed to read kv row: {}", err))?
                else {
                    continue;
                };
                let raw: String = row
                    .get(0)
                    .map_err(|err| format!("Failed to decode kv row: {}", err))?;
                let value = serde_json::from_str(&raw).map_err(|err| {
                    format!("Failed to parse stored value for {}: {}", key.as_str(), err)
                })?;
                entries.insert(key.as_str().to_string(), value);
            }

            Ok(entries)
        })
    }

    /// Upserts every entry in one transaction.
    pub fn set_entries(&self, entries: &StoreMap) -> Result<(), String> {
        let updated_at = Utc::now().to_rfc3339();
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin kv transaction: {}", err))?;
            for (key, value) in entries {
                let raw = serde_json::to_string(value)
                    .map_err(|err| format!("Failed to serialize value for {}: {}", key, err))?;
                tx.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(key) DO UPDATE SET \
                        value = excluded.value, \
                        updated_at = excluded.updated_at",
                    params![key, raw, updated_at],
                )
                .map_err(|err| format!("Failed to upsert {}: {}", key, err))?;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit kv transaction: {}", err))
        })
    }

    pub fn remove_keys(&self, keys: &[StoreKey]) -> Result<(), String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin kv transaction: {}", err))?;
            for key in keys {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key.as_str()])
                    .map_err(|err| format!("Failed to delete {}: {}", key.as_str(), err))?;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit kv transaction: {}", err))
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}
