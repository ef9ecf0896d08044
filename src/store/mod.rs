//! SQLite persistence store.
//!
//! Durable relational state for experiments, tasks, agents, the metric
//! cache, deployments, and the append-only event log. One connection behind
//! a mutex; every multi-controller-sensitive mutation is a single
//! conditional statement guarded by `changes() == 1` rather than
//! read-then-write application logic.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings (microsecond
//! precision, `Z` suffix) so lexicographic comparison in SQL matches
//! chronological order.

mod agents;
mod experiments;
mod metrics;
mod tasks;

pub use metrics::CardinalityRow;
pub use tasks::LeaseSweep;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::Value;

use crate::errors::StoreError;

/// Versioned migrations. `schema_migrations` records which have applied;
/// a version is the 1-based index into this slice.
const MIGRATIONS: &[&str] = &[
    // v1: full schema
    "
    CREATE TABLE IF NOT EXISTS experiments (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        phase TEXT NOT NULL DEFAULT 'pending',
        baseline_pipeline TEXT NOT NULL,
        candidate_pipeline TEXT NOT NULL,
        target_hosts TEXT NOT NULL,
        duration_secs INTEGER NOT NULL,
        warmup_secs INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        analysis_attempts INTEGER NOT NULL DEFAULT 0,
        cost_analysis TEXT
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        host_id TEXT NOT NULL,
        experiment_id TEXT,
        action TEXT NOT NULL,
        variant TEXT,
        config TEXT NOT NULL DEFAULT '{}',
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        assigned_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        result TEXT,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_claim
        ON tasks (host_id, status, priority DESC, created_at);
    CREATE INDEX IF NOT EXISTS idx_tasks_experiment
        ON tasks (experiment_id, action);

    CREATE TABLE IF NOT EXISTS agents (
        host_id TEXT PRIMARY KEY,
        hostname TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'unknown',
        last_heartbeat TEXT,
        capabilities TEXT NOT NULL DEFAULT '[]',
        resource_usage TEXT NOT NULL DEFAULT '{}',
        registered_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metric_cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        experiment_id TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        metric_name TEXT NOT NULL,
        variant TEXT NOT NULL,
        host_id TEXT NOT NULL,
        value REAL NOT NULL,
        labels TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_metric_cache_experiment
        ON metric_cache (experiment_id, variant, metric_name);

    CREATE TABLE IF NOT EXISTS experiment_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        experiment_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        phase TEXT NOT NULL,
        message TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE (experiment_id, seq)
    );

    CREATE TABLE IF NOT EXISTS pipeline_deployments (
        id TEXT PRIMARY KEY,
        experiment_id TEXT NOT NULL,
        name TEXT NOT NULL,
        namespace TEXT NOT NULL,
        pipeline TEXT NOT NULL,
        variant TEXT NOT NULL,
        host_id TEXT NOT NULL,
        status TEXT NOT NULL,
        metrics TEXT NOT NULL DEFAULT '{}',
        UNIQUE (experiment_id, variant, host_id)
    );
    ",
];

/// SQLite-backed persistence store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let applied: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            if version <= applied {
                continue;
            }
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, fmt_ts(Utc::now())],
            )?;
            tracing::info!(version, "applied schema migration");
        }
        Ok(())
    }

    /// Highest applied migration version.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let v = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(v)
    }
}

// ---------------------------------------------------------------------------
// Column helpers shared by the submodules
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 encoding used for every timestamp column.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parse_ts_opt(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, s)).transpose()
}

pub(crate) fn parse_json(idx: usize, raw: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parse_uuid(idx: usize, raw: String) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parse_enum<T>(
    idx: usize,
    raw: &str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        conversion_err(
            idx,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognized enum value '{raw}'"),
            ),
        )
    })
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
