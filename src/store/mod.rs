//! Durable SQLite storage for tasks and agents.
//!
//! `Database` owns the single connection behind a mutex so every write,
//! and every multi-row transaction, is serialized. `TaskStore` and
//! `AgentStore` are stateless row mappers that run against either a plain
//! connection or an open transaction, which lets the coordinator combine
//! task and agent writes in one commit.

mod agents;
mod tasks;

pub use agents::AgentStore;
pub use tasks::TaskStore;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Transaction};

use crate::{clog_debug, Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    title           TEXT NOT NULL,
    description     TEXT NOT NULL,
    agent_type      TEXT NOT NULL,
    dependencies    TEXT NOT NULL DEFAULT '[]',
    priority        INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL,
    metadata        TEXT NOT NULL DEFAULT '{}',
    assigned_agent  TEXT,
    result          TEXT,
    metrics         TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    assigned_at     TEXT,
    completed_at    TEXT
);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id     TEXT NOT NULL REFERENCES tasks(id),
    depends_on  TEXT NOT NULL REFERENCES tasks(id),
    PRIMARY KEY (task_id, depends_on)
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, priority);
CREATE INDEX IF NOT EXISTS idx_task_dependencies_on ON task_dependencies(depends_on);

CREATE TABLE IF NOT EXISTS agents (
    id              TEXT PRIMARY KEY,
    type            TEXT NOT NULL,
    capabilities    TEXT NOT NULL DEFAULT '[]',
    session_id      TEXT NOT NULL,
    metadata        TEXT NOT NULL DEFAULT '{}',
    status          TEXT NOT NULL,
    current_task    TEXT,
    metrics         TEXT NOT NULL DEFAULT '{}',
    registered_at   TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        clog_debug!("Database::open path={}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Persistence("database connection lock poisoned".to_string()))
    }

    /// Run reads against the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` in a transaction, committing only if it returns `Ok`.
    ///
    /// Dropping an uncommitted `Transaction` rolls it back, so an error
    /// anywhere inside `f` leaves the store untouched.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn unknown_enum(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown status value '{}'", raw).into(),
    )
}
