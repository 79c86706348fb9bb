//! Workload state snapshots — crash-recovery view of the supervisor.

use anyhow::Result;
use serde::Serialize;

use crate::workload::WorkloadState;

use super::{now_iso, Database};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkloadStateRow {
    pub name: String,
    pub workload_type: String,
    pub run_mode: String,
    pub status: String,
    pub pid: Option<i64>,
    pub run_count: i64,
    pub max_runs: Option<i64>,
    pub last_started: Option<String>,
    pub last_stopped: Option<String>,
    pub last_heartbeat: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: String,
}

impl Database {
    /// Upsert the snapshot row for a workload.
    pub async fn save_state(&self, state: &WorkloadState) -> Result<()> {
        sqlx::query(
            "INSERT INTO workload_state
                 (name, workload_type, run_mode, status, pid, run_count, max_runs,
                  last_started, last_stopped, last_heartbeat, last_error, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                 status = excluded.status,
                 pid = excluded.pid,
                 run_count = excluded.run_count,
                 last_started = excluded.last_started,
                 last_stopped = excluded.last_stopped,
                 last_heartbeat = excluded.last_heartbeat,
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at",
        )
        .bind(&state.spec.name)
        .bind(&state.spec.workload_type)
        .bind(state.spec.run_mode.as_str())
        .bind(state.status.as_str())
        .bind(state.pid.map(|p| p as i64))
        .bind(state.run_count as i64)
        .bind(state.spec.max_runs.map(|m| m as i64))
        .bind(state.last_started.map(|t| t.to_rfc3339()))
        .bind(state.last_stopped.map(|t| t.to_rfc3339()))
        .bind(state.last_heartbeat.map(|t| t.to_rfc3339()))
        .bind(&state.last_error)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_all_states(&self) -> Result<Vec<WorkloadStateRow>> {
        let rows = sqlx::query_as::<_, WorkloadStateRow>(
            "SELECT name, workload_type, run_mode, status, pid, run_count, max_runs,
                    last_started, last_stopped, last_heartbeat, last_error, updated_at
             FROM workload_state ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Drop the snapshot (and, via cascade, the run history) for a removed
    /// workload.
    pub async fn delete_state(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM workload_state WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{spec_fixture, WorkloadState, WorkloadStatus};

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let db = Database::open_in_memory().await.unwrap();
        let mut state = WorkloadState::new(spec_fixture("etl"));
        state.status = WorkloadStatus::Running;
        state.pid = Some(999);
        state.run_count = 2;
        db.save_state(&state).await.unwrap();

        let rows = db.load_all_states().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "etl");
        assert_eq!(rows[0].status, "running");
        assert_eq!(rows[0].pid, Some(999));
        assert_eq!(rows[0].run_count, 2);
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let db = Database::open_in_memory().await.unwrap();
        let mut state = WorkloadState::new(spec_fixture("etl"));
        db.save_state(&state).await.unwrap();
        state.status = WorkloadStatus::Failed;
        state.last_error = Some("oom".into());
        db.save_state(&state).await.unwrap();

        let rows = db.load_all_states().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "failed");
        assert_eq!(rows[0].last_error.as_deref(), Some("oom"));
    }

    #[tokio::test]
    async fn delete_cascades_to_run_history() {
        let db = Database::open_in_memory().await.unwrap();
        let state = WorkloadState::new(spec_fixture("etl"));
        db.save_state(&state).await.unwrap();
        let id = db.record_start("etl").await.unwrap();
        db.record_finish(id, 0, None).await.unwrap();

        db.delete_state("etl").await.unwrap();
        assert!(db.load_all_states().await.unwrap().is_empty());
        assert!(db.run_history("etl", 10).await.unwrap().is_empty());
    }
}
