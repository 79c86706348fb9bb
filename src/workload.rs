//! # Workload Model — Specs, Runtime State, Status Machine
//!
//! The declarative `WorkloadSpec` is immutable and value-equal; the runner
//! restarts a workload whenever a reload produces a spec that compares
//! unequal to the registered one. `WorkloadState` is the mutable runtime
//! side, owned by the runner and read by everything else through snapshots.
//!
//! ## Status Machine
//!
//! ```text
//! registered → starting → running → ┬ stopping → stopped
//!                  ↑                ├ completed
//!                  └── (restart) ───┤ failed
//!                                   └ starting (supervised restart)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Restart/completion policy tag. The actual policy lives in
/// [`crate::modes::RunModeStrategy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Schedule,
    Forever,
    NTimes,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Schedule => "schedule",
            RunMode::Forever => "forever",
            RunMode::NTimes => "n_times",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Completed,
}

impl WorkloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadStatus::Registered => "registered",
            WorkloadStatus::Starting => "starting",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopping => "stopping",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Failed => "failed",
            WorkloadStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable workload specification, keyed by `name` (unique per node).
///
/// Equality is total and structural; `params` compares key-by-key with key
/// order irrelevant (`serde_json::Map` equality). Reload reconciliation
/// relies on this to decide which workloads need a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    /// Free-form type tag. Built-ins are "agent", "script", "service";
    /// plugins may register more.
    pub workload_type: String,
    pub run_mode: RunMode,
    pub module_path: String,
    pub entry_point: String,
    pub schedule: Option<String>,
    pub max_runs: Option<u32>,
    pub params: Map<String, Value>,
    pub restart_delay_seconds: f64,
    pub timeout_seconds: Option<f64>,
    pub tags: Vec<String>,
    pub version: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_nice: Option<i32>,
}

impl WorkloadSpec {
    /// Serialized params handed to the worker child via `--params-json`.
    pub fn params_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Mutable runtime state paired with a spec. Owned by the runner; all other
/// components read cloned snapshots.
#[derive(Clone, Debug, Serialize)]
pub struct WorkloadState {
    pub spec: WorkloadSpec,
    pub status: WorkloadStatus,
    pub pid: Option<u32>,
    pub run_count: u32,
    pub last_started: Option<DateTime<Utc>>,
    pub last_stopped: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WorkloadState {
    pub fn new(spec: WorkloadSpec) -> Self {
        WorkloadState {
            spec,
            status: WorkloadStatus::Registered,
            pid: None,
            run_count: 0,
            last_started: None,
            last_stopped: None,
            last_heartbeat: None,
            last_error: None,
        }
    }

    /// Compact JSON row used by the socket protocol and the node `list`
    /// endpoint.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "name": self.spec.name,
            "type": self.spec.workload_type,
            "run_mode": self.spec.run_mode.as_str(),
            "status": self.status.as_str(),
            "pid": self.pid,
            "run_count": self.run_count,
            "last_started": self.last_started.map(|t| t.to_rfc3339()),
            "last_stopped": self.last_stopped.map(|t| t.to_rfc3339()),
            "last_error": self.last_error,
            "version": self.spec.version,
        })
    }

    /// Extended JSON shape for `status` responses: the summary plus the
    /// spec fields an operator needs to understand the schedule.
    pub fn detail(&self) -> Value {
        let mut v = self.summary();
        if let Some(obj) = v.as_object_mut() {
            obj.insert("schedule".into(), serde_json::json!(self.spec.schedule));
            obj.insert("max_runs".into(), serde_json::json!(self.spec.max_runs));
            obj.insert("module".into(), serde_json::json!(self.spec.module_path));
            obj.insert(
                "entry_point".into(),
                serde_json::json!(self.spec.entry_point),
            );
            obj.insert("tags".into(), serde_json::json!(self.spec.tags));
        }
        v
    }
}

#[cfg(test)]
pub(crate) fn spec_fixture(name: &str) -> WorkloadSpec {
    WorkloadSpec {
        name: name.to_string(),
        workload_type: "script".to_string(),
        run_mode: RunMode::Forever,
        module_path: "jobs.pipeline".to_string(),
        entry_point: "run".to_string(),
        schedule: None,
        max_runs: None,
        params: Map::new(),
        restart_delay_seconds: 5.0,
        timeout_seconds: None,
        tags: Vec::new(),
        version: None,
        memory_limit_mb: None,
        cpu_nice: None,
    }
}
