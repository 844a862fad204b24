//! Persistent typed key-value settings store.
//!
//! # Schema
//! One `settings` table, JSON-encoded values, one row per key.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! # Well-known keys
//! `agent_id`, `agent_name`, `install_path`, `accept_connections`,
//! `authorized_hubs`, `tracked_shortcuts`, `telemetry_enabled`,
//! `telemetry_interval`, `console_log_enabled`, plus the frontend-bridge
//! `_queue_*` / `_event_*` families (see `bridge`).

use rusqlite::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Shared handle used across the agent; all writers run on the runtime.
pub type SharedSettings = Arc<Mutex<Settings>>;

pub struct Settings {
    conn: Connection,
}

impl Settings {
    /// Open (or create) the settings store at the given path.
    pub fn open(path: &Path) -> SettingsResult<Self> {
        let conn = Connection::open(path)?;
        let s = Self { conn };
        s.apply_pragmas()?;
        s.integrity_check()?;
        s.apply_schema()?;
        Ok(s)
    }

    pub fn open_in_memory() -> SettingsResult<Self> {
        let conn = Connection::open_in_memory()?;
        let s = Self { conn };
        s.apply_pragmas()?;
        s.apply_schema()?;
        Ok(s)
    }

    /// Read a key into a typed value.  Returns `None` for missing keys.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> SettingsResult<Option<T>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |r| r.get::<_, String>(0))?;
        match rows.next().transpose()? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read a key, falling back to `default` when missing or unreadable.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).ok().flatten().unwrap_or(default)
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> SettingsResult<()> {
        let raw = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, raw],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> SettingsResult<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// List keys starting with `prefix` (used by the bridge startup sweep).
    pub fn keys_with_prefix(&self, prefix: &str) -> SettingsResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM settings WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
        let pattern = format!("{}%", escape_like(prefix));
        let rows = stmt.query_map(params![pattern], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn apply_pragmas(&self) -> SettingsResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;",
        )?;
        Ok(())
    }

    fn integrity_check(&self) -> SettingsResult<()> {
        let r: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if r != "ok" {
            return Err(SettingsError::IntegrityCheckFailed(r));
        }
        Ok(())
    }

    fn apply_schema(&self) -> SettingsResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

/// Escape `%` and `_` so a literal prefix survives the LIKE pattern.
fn escape_like(s: &str) -> String {
    // Bridge prefixes don't contain wildcards today, but keys are open-ended.
    s.replace('%', "\\%").replace('_', "\\_")
}
