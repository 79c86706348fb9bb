//! Run history — one row per child-process invocation.
//!
//! `record_start` opens the row when the child launches; `record_finish`
//! closes it with the exit code, the stderr tail, and the wall-clock
//! duration. Rows are never updated after finishing.

use anyhow::Result;
use chrono::DateTime;
use serde::Serialize;

use super::{now_iso, Database};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub workload_name: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

impl Database {
    /// Open a run row; returns its id for the matching `record_finish`.
    pub async fn record_start(&self, workload_name: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO run_history (workload_name, started_at) VALUES (?, ?)")
            .bind(workload_name)
            .bind(now_iso())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Close a run row with its outcome.
    pub async fn record_finish(
        &self,
        run_id: i64,
        exit_code: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        let started_at: Option<String> =
            sqlx::query_scalar("SELECT started_at FROM run_history WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        let finished = now_iso();
        let duration_ms = started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .and_then(|start| {
                DateTime::parse_from_rfc3339(&finished)
                    .ok()
                    .map(|end| (end - start).num_milliseconds())
            });
        sqlx::query(
            "UPDATE run_history
             SET finished_at = ?, exit_code = ?, error_message = ?, duration_ms = ?
             WHERE id = ?",
        )
        .bind(&finished)
        .bind(exit_code)
        .bind(error_message)
        .bind(duration_ms)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent runs for a workload, newest first.
    pub async fn run_history(&self, workload_name: &str, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRecord>(
            "SELECT id, workload_name, started_at, finished_at,
                    exit_code, error_message, duration_ms
             FROM run_history
             WHERE workload_name = ?
             ORDER BY started_at DESC, id DESC
             LIMIT ?",
        )
        .bind(workload_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{spec_fixture, WorkloadState};

    async fn db_with_state(name: &str) -> Database {
        let db = Database::open_in_memory().await.unwrap();
        let state = WorkloadState::new(spec_fixture(name));
        db.save_state(&state).await.unwrap();
        db
    }

    #[tokio::test]
    async fn start_then_finish_fills_the_row() {
        let db = db_with_state("etl").await;
        let id = db.record_start("etl").await.unwrap();
        db.record_finish(id, 0, None).await.unwrap();

        let rows = db.run_history("etl", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.exit_code, Some(0));
        assert!(row.finished_at.is_some());
        assert!(row.error_message.is_none());
        assert!(row.duration_ms.unwrap_or(-1) >= 0);
    }

    #[tokio::test]
    async fn open_run_has_null_finish_fields() {
        let db = db_with_state("etl").await;
        db.record_start("etl").await.unwrap();
        let rows = db.run_history("etl", 10).await.unwrap();
        assert!(rows[0].finished_at.is_none());
        assert!(rows[0].exit_code.is_none());
        assert!(rows[0].duration_ms.is_none());
    }

    #[tokio::test]
    async fn failed_run_keeps_error_tail() {
        let db = db_with_state("etl").await;
        let id = db.record_start("etl").await.unwrap();
        db.record_finish(id, 1, Some("boom: stack trace tail"))
            .await
            .unwrap();
        let rows = db.run_history("etl", 10).await.unwrap();
        assert_eq!(rows[0].exit_code, Some(1));
        assert_eq!(rows[0].error_message.as_deref(), Some("boom: stack trace tail"));
    }

    #[tokio::test]
    async fn history_is_limited_and_per_workload() {
        let db = db_with_state("a").await;
        let state_b = WorkloadState::new(spec_fixture("b"));
        db.save_state(&state_b).await.unwrap();

        for _ in 0..5 {
            let id = db.record_start("a").await.unwrap();
            db.record_finish(id, 0, None).await.unwrap();
        }
        db.record_start("b").await.unwrap();

        assert_eq!(db.run_history("a", 3).await.unwrap().len(), 3);
        assert_eq!(db.run_history("b", 10).await.unwrap().len(), 1);
        assert!(db.run_history("ghost", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_workload_violates_foreign_key() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.record_start("never-registered").await.is_err());
    }
}
