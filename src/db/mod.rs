//! # Database — Node-Local SQLite Storage
//!
//! Durable state for one supervisor: crash-recovery snapshots of workload
//! state and the append-only run history, via `sqlx::SqlitePool`.
//!
//! ## Schema
//!
//! - `workload_state`: one row per workload, upserted on every lifecycle
//!   change, used to answer "what was running" after a restart
//! - `run_history`: one row per child-process invocation
//! - `_migrations`: applied migration names, forward-only
//!
//! ## Concurrency
//!
//! WAL journal mode, foreign keys on, and a single-connection pool: the
//! supervisor is the only writer, and a pool of one serializes writes
//! without a separate lock.
//!
//! ## Module Structure
//!
//! Operations are split into submodules by domain, each an `impl Database`
//! block: [`run_history`], [`workload_state`].

mod run_history;
mod workload_state;

pub use run_history::RunRecord;
pub use workload_state::WorkloadStateRow;

use std::path::Path;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Fixed-width UTC timestamp; lexicographic order equals chronological
/// order, which cutoff comparisons in SQL rely on.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Run pending migrations in order, recording each in `_migrations`.
pub async fn apply_migrations(pool: &SqlitePool, migrations: &[(&str, &str)]) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;
    let applied: Vec<String> = sqlx::query_scalar("SELECT name FROM _migrations")
        .fetch_all(pool)
        .await?;
    for (name, sql) in migrations {
        if applied.iter().any(|a| a == name) {
            continue;
        }
        sqlx::raw_sql(sql).execute(pool).await?;
        sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(now_iso())
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub(crate) async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

pub(crate) async fn open_memory_pool() -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

const MIGRATIONS: &[(&str, &str)] = &[(
    "001_node_init",
    "CREATE TABLE IF NOT EXISTS workload_state (
         name TEXT PRIMARY KEY,
         workload_type TEXT NOT NULL,
         run_mode TEXT NOT NULL,
         status TEXT NOT NULL,
         pid INTEGER,
         run_count INTEGER NOT NULL DEFAULT 0,
         max_runs INTEGER,
         last_started TEXT,
         last_stopped TEXT,
         last_heartbeat TEXT,
         last_error TEXT,
         updated_at TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS run_history (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         workload_name TEXT NOT NULL REFERENCES workload_state(name) ON DELETE CASCADE,
         started_at TEXT NOT NULL,
         finished_at TEXT,
         exit_code INTEGER,
         error_message TEXT,
         duration_ms INTEGER
     );
     CREATE INDEX IF NOT EXISTS idx_run_history_workload
         ON run_history(workload_name, started_at);",
)];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the node database and bring the schema up
    /// to date.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path).await?;
        apply_migrations(&pool, MIGRATIONS).await?;
        Ok(Database { pool })
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = open_memory_pool().await?;
        apply_migrations(&pool, MIGRATIONS).await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
