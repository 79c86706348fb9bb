//! # Fleet — Controller-Side Coordination
//!
//! Everything the central process uses to track and drive nodes:
//!
//! - [`store`] — SQLite state store (clients, workloads, deployments)
//! - [`deployer`] — batched rolling deployments with health gating
//! - [`http_client`] — controller → node RPC
//!
//! This module holds the wire models shared between the daemon's heartbeat
//! reporter and the controller's API.

pub mod deployer;
pub mod http_client;
pub mod store;

use serde::{Deserialize, Serialize};

use crate::metrics::SystemMetrics;
use crate::workload::WorkloadState;

/// Workload state row as reported by a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub workload_type: String,
    pub run_mode: String,
    pub status: String,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub run_count: i64,
    #[serde(default)]
    pub last_started: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl From<&WorkloadState> for WorkloadInfo {
    fn from(state: &WorkloadState) -> Self {
        WorkloadInfo {
            name: state.spec.name.clone(),
            workload_type: state.spec.workload_type.clone(),
            run_mode: state.spec.run_mode.as_str().to_string(),
            status: state.status.as_str().to_string(),
            pid: state.pid.map(|p| p as i64),
            run_count: state.run_count as i64,
            last_started: state.last_started.map(|t| t.to_rfc3339()),
            last_error: state.last_error.clone(),
        }
    }
}

/// Heartbeat POSTed by every node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub client_name: String,
    pub timestamp: String,
    #[serde(default)]
    pub deployed_version: Option<String>,
    #[serde(default)]
    pub workloads: Vec<WorkloadInfo>,
    #[serde(default)]
    pub system: SystemMetrics,
}

/// Client summary served by the controller API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientOverview {
    pub name: String,
    pub host: String,
    pub api_port: u16,
    pub status: String,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub workload_count: i64,
    #[serde(default)]
    pub workloads_running: i64,
    #[serde(default)]
    pub workloads_failed: i64,
    #[serde(default)]
    pub deployed_version: Option<String>,
    #[serde(default)]
    pub system: Option<SystemMetrics>,
}

/// Generic command outcome proxied from a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

fn default_batch_size() -> i64 {
    1
}

fn default_auto_rollback() -> bool {
    true
}

fn default_health_check_timeout() -> f64 {
    60.0
}

/// Operator request that opens a deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub version: String,
    /// Explicit targets; empty means "every online client".
    #[serde(default)]
    pub target_clients: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_auto_rollback")]
    pub auto_rollback: bool,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: f64,
}

/// Per-client deployment progress row.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeploymentClientStatus {
    pub client_name: String,
    pub batch_number: i64,
    pub status: String,
    pub previous_version: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

/// Full deployment view served by the controller API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentView {
    pub id: String,
    pub version: String,
    pub status: String,
    pub batch_size: i64,
    pub target_clients: Vec<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub client_statuses: Vec<DeploymentClientStatus>,
}
