//! Validated shape of a workload definition file.
//!
//! A file is either a single workload mapping or `{workloads: [...]}`.
//! Cross-field rules are enforced here, before anything touches the
//! registry: schedule-mode workloads need a parseable cron expression,
//! n-times workloads a positive quota, and resource limits must be sane.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::scheduler;
use crate::workload::{RunMode, WorkloadSpec};

fn default_entry_point() -> String {
    "run".to_string()
}

fn default_restart_delay() -> f64 {
    5.0
}

#[derive(Debug, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub workload_type: String,
    pub run_mode: RunMode,
    pub module: String,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default = "default_restart_delay")]
    pub restart_delay: f64,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub cpu_nice: Option<i32>,
}

/// Files with a top-level `workloads` list.
#[derive(Debug, Deserialize)]
pub struct MultiWorkloadConfig {
    pub workloads: Vec<WorkloadConfig>,
}

impl WorkloadConfig {
    /// Cross-field validation. `known_types` comes from the plugin
    /// registry; `None` skips the type check (used by tooling that has no
    /// registry at hand).
    pub fn validate(&self, known_types: Option<&std::collections::BTreeSet<String>>) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("'name' must not be empty".to_string());
        }
        if let Some(types) = known_types {
            if !types.contains(&self.workload_type) {
                return Err(format!(
                    "unknown workload type '{}' (known: {})",
                    self.workload_type,
                    types.iter().cloned().collect::<Vec<_>>().join(", ")
                ));
            }
        }
        match self.run_mode {
            RunMode::Schedule => match &self.schedule {
                None => {
                    return Err(
                        "'schedule' field is required when run_mode is 'schedule'".to_string()
                    )
                }
                Some(expr) => scheduler::validate_expression(expr)
                    .map_err(|e| format!("invalid cron expression '{}': {}", expr, e))?,
            },
            RunMode::NTimes => match self.max_runs {
                None => {
                    return Err(
                        "'max_runs' field is required when run_mode is 'n_times'".to_string()
                    )
                }
                Some(0) => return Err("'max_runs' must be positive".to_string()),
                Some(_) => {}
            },
            RunMode::Forever => {}
        }
        if self.restart_delay < 0.0 {
            return Err("'restart_delay' must be >= 0".to_string());
        }
        if let Some(t) = self.timeout {
            if t <= 0.0 {
                return Err("'timeout' must be positive".to_string());
            }
        }
        if self.memory_limit_mb == Some(0) {
            return Err("'memory_limit_mb' must be > 0".to_string());
        }
        if let Some(nice) = self.cpu_nice {
            if !(-20..=19).contains(&nice) {
                return Err("'cpu_nice' must be between -20 and 19".to_string());
            }
        }
        Ok(())
    }

    pub fn into_spec(self) -> WorkloadSpec {
        WorkloadSpec {
            name: self.name,
            workload_type: self.workload_type,
            run_mode: self.run_mode,
            module_path: self.module,
            entry_point: self.entry_point,
            schedule: self.schedule,
            max_runs: self.max_runs,
            params: self.params,
            restart_delay_seconds: self.restart_delay,
            timeout_seconds: self.timeout,
            tags: self.tags,
            version: self.version,
            memory_limit_mb: self.memory_limit_mb,
            cpu_nice: self.cpu_nice,
        }
    }
}
