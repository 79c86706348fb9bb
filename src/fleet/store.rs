//! # Fleet State Store — Central SQLite Database
//!
//! The controller's durable view of the fleet: one row per client kept
//! fresh by heartbeats, denormalized workload rows replaced wholesale on
//! every heartbeat, and the deployment ledger.
//!
//! ## Heartbeat contract
//!
//! `upsert_heartbeat` is one transaction: upsert the client (a null
//! `deployed_version` in the payload preserves the stored value), upsert
//! every reported workload, delete rows the client stopped reporting.
//!
//! ## Status lifecycle
//!
//! `unknown → discovered → online ⇄ offline`. Heartbeats force `online`;
//! the stale reaper flips silent `online` rows to `offline`; discovery
//! never demotes an `online` client.

use std::path::Path;

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::db::{apply_migrations, now_iso, open_memory_pool, open_pool};
use crate::fleet::{ClientOverview, DeploymentClientStatus, DeploymentView, HeartbeatPayload};
use crate::metrics::SystemMetrics;

const MIGRATIONS: &[(&str, &str)] = &[(
    "001_fleet_init",
    "CREATE TABLE IF NOT EXISTS fleet_clients (
         name TEXT PRIMARY KEY,
         host TEXT NOT NULL,
         api_port INTEGER NOT NULL DEFAULT 9100,
         status TEXT NOT NULL DEFAULT 'unknown',
         last_seen TEXT,
         cpu_percent REAL,
         memory_used_mb REAL,
         memory_total_mb REAL,
         disk_used_gb REAL,
         disk_total_gb REAL,
         deployed_version TEXT,
         deployed_at TEXT,
         updated_at TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS fleet_workloads (
         client_name TEXT NOT NULL REFERENCES fleet_clients(name) ON DELETE CASCADE,
         workload_name TEXT NOT NULL,
         workload_type TEXT,
         run_mode TEXT,
         status TEXT,
         pid INTEGER,
         run_count INTEGER NOT NULL DEFAULT 0,
         last_started TEXT,
         last_error TEXT,
         updated_at TEXT NOT NULL,
         PRIMARY KEY (client_name, workload_name)
     );
     CREATE TABLE IF NOT EXISTS deployments (
         id TEXT PRIMARY KEY,
         version TEXT NOT NULL,
         status TEXT NOT NULL DEFAULT 'pending',
         batch_size INTEGER NOT NULL,
         target_clients TEXT NOT NULL,
         created_at TEXT NOT NULL,
         started_at TEXT,
         completed_at TEXT,
         error TEXT,
         updated_at TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS deployment_clients (
         deployment_id TEXT NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
         client_name TEXT NOT NULL,
         batch_number INTEGER NOT NULL,
         status TEXT NOT NULL DEFAULT 'pending',
         previous_version TEXT,
         started_at TEXT,
         completed_at TEXT,
         error TEXT,
         PRIMARY KEY (deployment_id, client_name)
     );",
)];

#[derive(Clone)]
pub struct FleetStore {
    pool: SqlitePool,
}

impl FleetStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path).await?;
        apply_migrations(&pool, MIGRATIONS).await?;
        Ok(FleetStore { pool })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let pool = open_memory_pool().await?;
        apply_migrations(&pool, MIGRATIONS).await?;
        Ok(FleetStore { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Heartbeats ──────────────────────────────────────────────

    /// Apply one heartbeat atomically: client row, workload rows, and the
    /// deletion of workloads the client no longer reports.
    pub async fn upsert_heartbeat(&self, payload: &HeartbeatPayload, host: &str) -> Result<()> {
        let now = now_iso();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO fleet_clients
                 (name, host, api_port, status, last_seen,
                  cpu_percent, memory_used_mb, memory_total_mb,
                  disk_used_gb, disk_total_gb, deployed_version, updated_at)
             VALUES (?, ?, 9100, 'online', ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                 host = excluded.host,
                 status = 'online',
                 last_seen = excluded.last_seen,
                 cpu_percent = excluded.cpu_percent,
                 memory_used_mb = excluded.memory_used_mb,
                 memory_total_mb = excluded.memory_total_mb,
                 disk_used_gb = excluded.disk_used_gb,
                 disk_total_gb = excluded.disk_total_gb,
                 deployed_version = COALESCE(excluded.deployed_version, deployed_version),
                 updated_at = excluded.updated_at",
        )
        .bind(&payload.client_name)
        .bind(host)
        .bind(&now)
        .bind(payload.system.cpu_percent)
        .bind(payload.system.memory_used_mb)
        .bind(payload.system.memory_total_mb)
        .bind(payload.system.disk_used_gb)
        .bind(payload.system.disk_total_gb)
        .bind(&payload.deployed_version)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for wl in &payload.workloads {
            sqlx::query(
                "INSERT INTO fleet_workloads
                     (client_name, workload_name, workload_type, run_mode,
                      status, pid, run_count, last_started, last_error, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(client_name, workload_name) DO UPDATE SET
                     workload_type = excluded.workload_type,
                     run_mode = excluded.run_mode,
                     status = excluded.status,
                     pid = excluded.pid,
                     run_count = excluded.run_count,
                     last_started = excluded.last_started,
                     last_error = excluded.last_error,
                     updated_at = excluded.updated_at",
            )
            .bind(&payload.client_name)
            .bind(&wl.name)
            .bind(&wl.workload_type)
            .bind(&wl.run_mode)
            .bind(&wl.status)
            .bind(wl.pid)
            .bind(wl.run_count)
            .bind(&wl.last_started)
            .bind(&wl.last_error)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        if payload.workloads.is_empty() {
            sqlx::query("DELETE FROM fleet_workloads WHERE client_name = ?")
                .bind(&payload.client_name)
                .execute(&mut *tx)
                .await?;
        } else {
            let placeholders = vec!["?"; payload.workloads.len()].join(",");
            let sql = format!(
                "DELETE FROM fleet_workloads
                 WHERE client_name = ? AND workload_name NOT IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(&payload.client_name);
            for wl in &payload.workloads {
                query = query.bind(&wl.name);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Flip silent online clients to offline; returns how many flipped.
    pub async fn mark_stale_clients(&self, threshold_seconds: f64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::milliseconds((threshold_seconds * 1000.0) as i64))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let result = sqlx::query(
            "UPDATE fleet_clients SET status = 'offline', updated_at = ?
             WHERE status = 'online' AND last_seen < ?",
        )
        .bind(now_iso())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Record a discovered client. Heartbeats outrank discovery: an
    /// `online` row is left untouched.
    pub async fn register_discovered_client(&self, name: &str, host: &str, port: u16) -> Result<()> {
        sqlx::query(
            "INSERT INTO fleet_clients (name, host, api_port, status, updated_at)
             VALUES (?, ?, ?, 'discovered', ?)
             ON CONFLICT(name) DO UPDATE SET
                 host = excluded.host,
                 api_port = excluded.api_port,
                 status = 'discovered',
                 updated_at = excluded.updated_at
             WHERE fleet_clients.status != 'online'",
        )
        .bind(name)
        .bind(host)
        .bind(port)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Authoritative (host, port) mapping used to address a node.
    pub async fn resolve_client_endpoint(&self, name: &str) -> Result<Option<(String, u16)>> {
        let row = sqlx::query("SELECT host, api_port FROM fleet_clients WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get::<String, _>("host"), r.get::<i64, _>("api_port") as u16)))
    }

    // ── Client queries ──────────────────────────────────────────

    const CLIENT_SELECT: &'static str =
        "SELECT c.name, c.host, c.api_port, c.status, c.last_seen,
                c.cpu_percent, c.memory_used_mb, c.memory_total_mb,
                c.disk_used_gb, c.disk_total_gb, c.deployed_version,
                COUNT(w.workload_name) AS workload_count,
                SUM(CASE WHEN w.status = 'running' THEN 1 ELSE 0 END) AS workloads_running,
                SUM(CASE WHEN w.status = 'failed' THEN 1 ELSE 0 END) AS workloads_failed
         FROM fleet_clients c
         LEFT JOIN fleet_workloads w ON w.client_name = c.name";

    pub async fn list_clients(&self) -> Result<Vec<ClientOverview>> {
        let sql = format!("{} GROUP BY c.name ORDER BY c.name", Self::CLIENT_SELECT);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_overview).collect())
    }

    pub async fn get_client(&self, name: &str) -> Result<Option<ClientOverview>> {
        let sql = format!("{} WHERE c.name = ? GROUP BY c.name", Self::CLIENT_SELECT);
        let row = sqlx::query(&sql).bind(name).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(row_to_overview))
    }

    pub async fn get_workloads(&self, client_name: &str) -> Result<Vec<crate::fleet::WorkloadInfo>> {
        let rows = sqlx::query(
            "SELECT workload_name, workload_type, run_mode, status,
                    pid, run_count, last_started, last_error
             FROM fleet_workloads
             WHERE client_name = ?
             ORDER BY workload_name",
        )
        .bind(client_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_workload_info).collect())
    }

    pub async fn get_workload(
        &self,
        client_name: &str,
        workload_name: &str,
    ) -> Result<Option<crate::fleet::WorkloadInfo>> {
        let row = sqlx::query(
            "SELECT workload_name, workload_type, run_mode, status,
                    pid, run_count, last_started, last_error
             FROM fleet_workloads
             WHERE client_name = ? AND workload_name = ?",
        )
        .bind(client_name)
        .bind(workload_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_workload_info))
    }

    // ── Deployments ─────────────────────────────────────────────

    pub async fn create_deployment(
        &self,
        deployment_id: &str,
        version: &str,
        target_clients: &[String],
        batch_size: i64,
        client_batches: &[(String, i64)],
    ) -> Result<()> {
        let now = now_iso();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO deployments
                 (id, version, status, batch_size, target_clients, created_at, updated_at)
             VALUES (?, ?, 'pending', ?, ?, ?, ?)",
        )
        .bind(deployment_id)
        .bind(version)
        .bind(batch_size)
        .bind(serde_json::to_string(target_clients)?)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        for (client_name, batch_number) in client_batches {
            sqlx::query(
                "INSERT INTO deployment_clients (deployment_id, client_name, batch_number, status)
                 VALUES (?, ?, ?, 'pending')",
            )
            .bind(deployment_id)
            .bind(client_name)
            .bind(batch_number)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_deployment_status(
        &self,
        deployment_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let now = now_iso();
        match status {
            "in_progress" => {
                sqlx::query(
                    "UPDATE deployments SET status = ?, started_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(status)
                .bind(&now)
                .bind(&now)
                .bind(deployment_id)
                .execute(&self.pool)
                .await?;
            }
            "completed" | "failed" | "rolled_back" => {
                sqlx::query(
                    "UPDATE deployments SET status = ?, completed_at = ?, error = ?, updated_at = ? WHERE id = ?",
                )
                .bind(status)
                .bind(&now)
                .bind(error)
                .bind(&now)
                .bind(deployment_id)
                .execute(&self.pool)
                .await?;
            }
            _ => {
                sqlx::query(
                    "UPDATE deployments SET status = ?, error = ?, updated_at = ? WHERE id = ?",
                )
                .bind(status)
                .bind(error)
                .bind(&now)
                .bind(deployment_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn update_deployment_client_status(
        &self,
        deployment_id: &str,
        client_name: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let now = now_iso();
        match status {
            "deploying" => {
                sqlx::query(
                    "UPDATE deployment_clients SET status = ?, started_at = ?
                     WHERE deployment_id = ? AND client_name = ?",
                )
                .bind(status)
                .bind(&now)
                .bind(deployment_id)
                .bind(client_name)
                .execute(&self.pool)
                .await?;
            }
            "healthy" | "failed" | "rolled_back" => {
                sqlx::query(
                    "UPDATE deployment_clients SET status = ?, completed_at = ?, error = ?
                     WHERE deployment_id = ? AND client_name = ?",
                )
                .bind(status)
                .bind(&now)
                .bind(error)
                .bind(deployment_id)
                .bind(client_name)
                .execute(&self.pool)
                .await?;
            }
            _ => {
                sqlx::query(
                    "UPDATE deployment_clients SET status = ?, error = ?
                     WHERE deployment_id = ? AND client_name = ?",
                )
                .bind(status)
                .bind(error)
                .bind(deployment_id)
                .bind(client_name)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn set_deployment_client_previous_version(
        &self,
        deployment_id: &str,
        client_name: &str,
        version: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deployment_clients SET previous_version = ?
             WHERE deployment_id = ? AND client_name = ?",
        )
        .bind(version)
        .bind(deployment_id)
        .bind(client_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Option<DeploymentView>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ?")
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let client_statuses = self.get_deployment_clients(deployment_id).await?;
        Ok(Some(row_to_deployment(&row, client_statuses)))
    }

    pub async fn get_deployment_clients(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<DeploymentClientStatus>> {
        let rows = sqlx::query_as::<_, DeploymentClientStatus>(
            "SELECT client_name, batch_number, status, previous_version,
                    started_at, completed_at, error
             FROM deployment_clients
             WHERE deployment_id = ?
             ORDER BY batch_number, client_name",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_deployments(&self, limit: i64) -> Result<Vec<DeploymentView>> {
        let rows = sqlx::query("SELECT * FROM deployments ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let clients = self.get_deployment_clients(&id).await?;
            result.push(row_to_deployment(row, clients));
        }
        Ok(result)
    }

    pub async fn update_client_deployed_version(
        &self,
        client_name: &str,
        version: &str,
    ) -> Result<()> {
        let now = now_iso();
        sqlx::query(
            "UPDATE fleet_clients
             SET deployed_version = ?, deployed_at = ?, updated_at = ?
             WHERE name = ?",
        )
        .bind(version)
        .bind(&now)
        .bind(&now)
        .bind(client_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_overview(row: &sqlx::sqlite::SqliteRow) -> ClientOverview {
    let cpu: Option<f64> = row.get("cpu_percent");
    let system = cpu.map(|cpu_percent| SystemMetrics {
        cpu_percent,
        memory_used_mb: row.get::<Option<f64>, _>("memory_used_mb").unwrap_or(0.0),
        memory_total_mb: row.get::<Option<f64>, _>("memory_total_mb").unwrap_or(0.0),
        disk_used_gb: row.get::<Option<f64>, _>("disk_used_gb").unwrap_or(0.0),
        disk_total_gb: row.get::<Option<f64>, _>("disk_total_gb").unwrap_or(0.0),
    });
    ClientOverview {
        name: row.get("name"),
        host: row.get("host"),
        api_port: row.get::<i64, _>("api_port") as u16,
        status: row.get("status"),
        last_seen: row.get("last_seen"),
        workload_count: row.get::<Option<i64>, _>("workload_count").unwrap_or(0),
        workloads_running: row.get::<Option<i64>, _>("workloads_running").unwrap_or(0),
        workloads_failed: row.get::<Option<i64>, _>("workloads_failed").unwrap_or(0),
        deployed_version: row.get("deployed_version"),
        system,
    }
}

fn row_to_workload_info(row: &sqlx::sqlite::SqliteRow) -> crate::fleet::WorkloadInfo {
    crate::fleet::WorkloadInfo {
        name: row.get("workload_name"),
        workload_type: row.get::<Option<String>, _>("workload_type").unwrap_or_default(),
        run_mode: row.get::<Option<String>, _>("run_mode").unwrap_or_default(),
        status: row.get::<Option<String>, _>("status").unwrap_or_default(),
        pid: row.get("pid"),
        run_count: row.get("run_count"),
        last_started: row.get("last_started"),
        last_error: row.get("last_error"),
    }
}

fn row_to_deployment(
    row: &sqlx::sqlite::SqliteRow,
    client_statuses: Vec<DeploymentClientStatus>,
) -> DeploymentView {
    let targets: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("target_clients")).unwrap_or_default();
    DeploymentView {
        id: row.get("id"),
        version: row.get("version"),
        status: row.get("status"),
        batch_size: row.get("batch_size"),
        target_clients: targets,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: row.get("error"),
        client_statuses,
    }
}
