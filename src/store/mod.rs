//! Analytical store
//!
//! A single SQLite file holds the append-only event log plus sibling tables
//! for mapper config, alert rules, alerts, chat sessions and user records.
//! Writes are serialised through one connection; the sandbox runtime opens
//! its own read-only connections against the same file.

pub mod alerts;
pub mod events;
pub mod mapper_cfg;
pub mod pruner;
pub mod sessions;
pub mod users;

pub use events::StoreStats;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use thiserror::Error;

/// Errors produced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("search query must be at least 2 characters")]
    QueryTooShort,
    #[error("not found")]
    NotFound,
    #[error("illegal alert transition from '{from}' to '{to}'")]
    IllegalTransition { from: String, to: String },
}

/// Shared handle to the analytical store.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
    /// Running byte estimate of the event table, primed at open.
    event_bytes: AtomicI64,
    /// Byte ceiling; pruning starts once the estimate exceeds it.
    byte_ceiling: u64,
    pruning_active: AtomicBool,
    last_prune_error: Mutex<Option<String>>,
}

/// Fixed per-row overhead added to payload+topic length when estimating the
/// event table size.
const ROW_OVERHEAD: i64 = 32;

impl Store {
    /// Open (or create) the store and run schema migration.
    pub fn open<P: AsRef<Path>>(path: P, byte_ceiling: u64) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;

        let primed: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(payload) + LENGTH(topic)), 0) \
             + COUNT(*) * ?1 FROM events",
            [ROW_OVERHEAD],
            |row| row.get(0),
        )?;

        tracing::info!(
            path = %path.display(),
            event_bytes = primed,
            byte_ceiling,
            "Analytical store opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            event_bytes: AtomicI64::new(primed),
            byte_ceiling,
            pruning_active: AtomicBool::new(false),
            last_prune_error: Mutex::new(None),
        })
    }

    /// In-memory store for tests (file-backed in a temp dir would also work,
    /// but the sandbox needs a real path, so tests that exercise `db.*`
    /// use `open()` with a tempfile instead).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            event_bytes: AtomicI64::new(0),
            byte_ceiling: u64::MAX,
            pruning_active: AtomicBool::new(false),
            last_prune_error: Mutex::new(None),
        })
    }

    /// Path of the backing file, used by the sandbox to open read-only
    /// connections.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_ceiling(&self) -> u64 {
        self.byte_ceiling
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_event_bytes(&self, delta: i64) {
        self.event_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn row_cost(topic: &str, payload: &[u8]) -> i64 {
        topic.len() as i64 + payload.len() as i64 + ROW_OVERHEAD
    }

    pub fn event_bytes(&self) -> u64 {
        self.event_bytes.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn pruning_active(&self) -> bool {
        self.pruning_active.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pruning_active(&self, active: bool) {
        self.pruning_active.store(active, Ordering::Relaxed);
    }

    pub fn last_prune_error(&self) -> Option<String> {
        self.last_prune_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_last_prune_error(&self, err: Option<String>) {
        *self
            .last_prune_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = err;
    }
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS events (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    broker_id TEXT NOT NULL,
    topic     TEXT NOT NULL,
    payload   BLOB NOT NULL,
    ts        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_topic_ts ON events(topic, ts);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
CREATE INDEX IF NOT EXISTS idx_events_broker_topic ON events(broker_id, topic, ts);

CREATE TABLE IF NOT EXISTS alert_rules (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    topic_pattern   TEXT NOT NULL,
    severity        TEXT NOT NULL,
    condition_code  TEXT NOT NULL,
    workflow_prompt TEXT,
    webhook         TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    id              TEXT PRIMARY KEY,
    rule_id         TEXT NOT NULL,
    rule_name       TEXT NOT NULL,
    topic           TEXT NOT NULL,
    trigger_value   BLOB NOT NULL,
    severity        TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    handled_by      TEXT,
    analysis_result TEXT
);
CREATE INDEX IF NOT EXISTS idx_alerts_rule_topic ON alerts(rule_id, topic, created_at);
CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);

CREATE TABLE IF NOT EXISTS chat_sessions (
    session_id TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    messages   TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    user_id    TEXT PRIMARY KEY,
    token      TEXT NOT NULL UNIQUE,
    admin      INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mapper_config (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    doc        TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";
