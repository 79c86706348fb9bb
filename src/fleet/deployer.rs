//! # Rolling Deployer — Batched Version Rollouts With Health Gating
//!
//! Drives a deployment from `pending` to a terminal state. Each active
//! deployment is one background task; batches run sequentially, the file
//! push inside a batch runs in parallel, reloads run sequentially, then a
//! health gate polls every node in the batch until it reports ok or the
//! deadline passes.
//!
//! ```text
//! pending ─► in_progress ─► completed
//!                │
//!                ├─► failed                    (auto_rollback = false)
//!                └─► rolling_back ─► rolled_back
//! ```
//!
//! File transfer is delegated to an external script invoked per client:
//! `{script} --client <name> --inventory <path> --sync-only --version <v>`.
//! A non-zero exit records the last 500 bytes of stderr (or stdout) on the
//! client row. Rollback re-pushes each client's recorded
//! `previous_version`; per-client rollback failures are logged and do not
//! abort rollback of the rest.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::fleet::http_client::FleetHttpClient;
use crate::fleet::store::FleetStore;
use crate::fleet::{DeploymentClientStatus, DeploymentRequest};
use crate::runner::lock_or_recover;

const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Bytes of script output kept as the per-client error.
const OUTPUT_TAIL_BYTES: usize = 500;

/// Client-row statuses that rollback must revert.
const ROLLBACK_STATUSES: &[&str] = &["deploying", "deployed", "healthy", "failed"];

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("No target clients available for deployment")]
    NoTargets,
    #[error("Deployment not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Store(String),
}

#[derive(Clone)]
pub struct RollingDeployer {
    store: FleetStore,
    client: FleetHttpClient,
    deploy_script: PathBuf,
    inventory_path: PathBuf,
    health_poll_interval: Duration,
    active: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RollingDeployer {
    pub fn new(
        store: FleetStore,
        client: FleetHttpClient,
        deploy_script: PathBuf,
        inventory_path: PathBuf,
    ) -> Self {
        RollingDeployer {
            store,
            client,
            deploy_script,
            inventory_path,
            health_poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Shorter gate polling for tests.
    pub fn with_health_poll_interval(mut self, interval: Duration) -> Self {
        self.health_poll_interval = interval;
        self
    }

    /// Resolve targets, persist the deployment and its batch assignment,
    /// and launch the background task. Returns the deployment id.
    pub async fn start_deployment(&self, request: DeploymentRequest) -> Result<String, DeployError> {
        let targets = if request.target_clients.is_empty() {
            self.store
                .list_clients()
                .await
                .map_err(|e| DeployError::Store(e.to_string()))?
                .into_iter()
                .filter(|c| c.status == "online")
                .map(|c| c.name)
                .collect()
        } else {
            request.target_clients.clone()
        };
        if targets.is_empty() {
            return Err(DeployError::NoTargets);
        }

        let deployment_id = Uuid::new_v4().to_string();
        let batch_size = request.batch_size.max(1);
        let assignment = batch_assignment(&targets, batch_size);
        self.store
            .create_deployment(&deployment_id, &request.version, &targets, batch_size, &assignment)
            .await
            .map_err(|e| DeployError::Store(e.to_string()))?;

        let batches = group_batches(&assignment);
        let this = self.clone();
        let id = deployment_id.clone();
        let handle = tokio::spawn(async move {
            this.execute(&id, &request, &batches).await;
            lock_or_recover(&this.active).remove(&id);
        });
        lock_or_recover(&self.active).insert(deployment_id.clone(), handle);
        Ok(deployment_id)
    }

    /// Abort the deployment task (preempts at the next await, ≤ one health
    /// poll) and mark the deployment failed.
    pub async fn cancel_deployment(&self, deployment_id: &str) -> Result<(), DeployError> {
        if self
            .store
            .get_deployment(deployment_id)
            .await
            .map_err(|e| DeployError::Store(e.to_string()))?
            .is_none()
        {
            return Err(DeployError::NotFound(deployment_id.to_string()));
        }
        let handle = lock_or_recover(&self.active).remove(deployment_id);
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.store
            .update_deployment_status(deployment_id, "failed", Some("Cancelled by user"))
            .await
            .map_err(|e| DeployError::Store(e.to_string()))?;
        warn!(deployment = %deployment_id, "deployment cancelled");
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        lock_or_recover(&self.active).len()
    }

    async fn execute(&self, deployment_id: &str, request: &DeploymentRequest, batches: &[Vec<String>]) {
        if let Err(e) = self
            .store
            .update_deployment_status(deployment_id, "in_progress", None)
            .await
        {
            error!(deployment = %deployment_id, error = %e, "deployment bookkeeping failed");
            return;
        }

        for (batch_num, batch) in batches.iter().enumerate() {
            info!(deployment = %deployment_id, batch = batch_num, clients = ?batch, "deploying batch");

            // Step 1: push files, parallel within the batch.
            let mut pushes = Vec::with_capacity(batch.len());
            for name in batch {
                let this = self.clone();
                let id = deployment_id.to_string();
                let client_name = name.clone();
                let version = request.version.clone();
                pushes.push((
                    name.clone(),
                    tokio::spawn(async move { this.deploy_single_client(&id, &client_name, &version).await }),
                ));
            }
            let mut failed: Vec<String> = Vec::new();
            for (name, handle) in pushes {
                if !handle.await.unwrap_or(false) {
                    failed.push(name);
                }
            }
            if !failed.is_empty() {
                error!(deployment = %deployment_id, failed_clients = ?failed, "batch deploy failed");
                self.finish_failed_batch(
                    deployment_id,
                    request,
                    batch_num as i64,
                    format!("Deploy failed for: {}", failed.join(", ")),
                )
                .await;
                return;
            }

            // Step 2: reload configs, sequential.
            let mut reload_failed: Vec<String> = Vec::new();
            for name in batch {
                match self.reload_client(deployment_id, name).await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(client = %name, error = %e, "reload failed");
                        reload_failed.push(name.clone());
                    }
                }
            }
            if !reload_failed.is_empty() {
                self.finish_failed_batch(
                    deployment_id,
                    request,
                    batch_num as i64,
                    format!("Reload failed for: {}", reload_failed.join(", ")),
                )
                .await;
                return;
            }

            // Step 3: health gate.
            if !self.wait_for_health(batch, request.health_check_timeout).await {
                self.finish_failed_batch(
                    deployment_id,
                    request,
                    batch_num as i64,
                    "Health check timeout".to_string(),
                )
                .await;
                return;
            }

            // Step 4: success for this batch.
            for name in batch {
                let _ = self
                    .store
                    .update_deployment_client_status(deployment_id, name, "healthy", None)
                    .await;
                let _ = self
                    .store
                    .update_client_deployed_version(name, &request.version)
                    .await;
            }
            info!(deployment = %deployment_id, batch = batch_num, "batch complete");
        }

        let _ = self
            .store
            .update_deployment_status(deployment_id, "completed", None)
            .await;
        info!(deployment = %deployment_id, "deployment completed");
    }

    async fn finish_failed_batch(
        &self,
        deployment_id: &str,
        request: &DeploymentRequest,
        failed_batch: i64,
        error: String,
    ) {
        if request.auto_rollback {
            self.rollback(deployment_id, failed_batch).await;
        } else {
            let _ = self
                .store
                .update_deployment_status(deployment_id, "failed", Some(&error))
                .await;
        }
    }

    /// Push one client: record its rollback version, run the deploy
    /// script, record the outcome. Returns success.
    async fn deploy_single_client(&self, deployment_id: &str, client_name: &str, version: &str) -> bool {
        if let Err(e) = self
            .store
            .update_deployment_client_status(deployment_id, client_name, "deploying", None)
            .await
        {
            error!(client = %client_name, error = %e, "deployment bookkeeping failed");
            return false;
        }

        let previous = match self.store.get_client(client_name).await {
            Ok(Some(client)) => client.deployed_version,
            _ => None,
        };
        let _ = self
            .store
            .set_deployment_client_previous_version(deployment_id, client_name, previous.as_deref())
            .await;

        match self.run_deploy_script(client_name, version).await {
            Ok(()) => true,
            Err(e) => {
                error!(client = %client_name, error = %e, "deploy script failed");
                let _ = self
                    .store
                    .update_deployment_client_status(deployment_id, client_name, "failed", Some(&e))
                    .await;
                false
            }
        }
    }

    async fn run_deploy_script(&self, client_name: &str, version: &str) -> Result<(), String> {
        let output = tokio::process::Command::new(&self.deploy_script)
            .arg("--client")
            .arg(client_name)
            .arg("--inventory")
            .arg(&self.inventory_path)
            .arg("--sync-only")
            .arg("--version")
            .arg(version)
            .output()
            .await
            .map_err(|e| format!("deploy script failed to execute: {}", e))?;
        if output.status.success() {
            return Ok(());
        }
        let tail = output_tail(&output.stderr).or_else(|| output_tail(&output.stdout));
        Err(tail.unwrap_or_else(|| format!("deploy script exited with {}", output.status)))
    }

    async fn reload_client(&self, deployment_id: &str, client_name: &str) -> Result<(), String> {
        let endpoint = self
            .store
            .resolve_client_endpoint(client_name)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no endpoint for client '{}'", client_name))?;
        match self.client.reload_configs(&endpoint.0, endpoint.1).await {
            Ok(_) => {
                let _ = self
                    .store
                    .update_deployment_client_status(deployment_id, client_name, "deployed", None)
                    .await;
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .store
                    .update_deployment_client_status(
                        deployment_id,
                        client_name,
                        "failed",
                        Some(&format!("Reload: {}", e)),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Poll the batch's health endpoints until every one reports ok or the
    /// deadline passes.
    async fn wait_for_health(&self, batch: &[String], timeout_seconds: f64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(timeout_seconds.max(0.0));
        loop {
            let mut all_healthy = true;
            for name in batch {
                let healthy = match self.store.resolve_client_endpoint(name).await {
                    Ok(Some((host, port))) => match self.client.health_check(&host, port).await {
                        Ok(body) => body.get("status").and_then(|s| s.as_str()) == Some("ok"),
                        Err(_) => false,
                    },
                    _ => false,
                };
                if !healthy {
                    all_healthy = false;
                }
            }
            if all_healthy {
                return true;
            }
            if tokio::time::Instant::now() + self.health_poll_interval > deadline {
                return false;
            }
            tokio::time::sleep(self.health_poll_interval).await;
        }
    }

    /// Revert every touched client in batches up to and including the
    /// failed one.
    async fn rollback(&self, deployment_id: &str, failed_batch: i64) {
        warn!(deployment = %deployment_id, failed_batch, "rolling back deployment");
        let _ = self
            .store
            .update_deployment_status(deployment_id, "rolling_back", None)
            .await;

        let clients = match self.store.get_deployment_clients(deployment_id).await {
            Ok(clients) => clients,
            Err(e) => {
                error!(deployment = %deployment_id, error = %e, "rollback read failed");
                return;
            }
        };

        for client in rollback_set(&clients, failed_batch) {
            if let Some(previous) = &client.previous_version {
                let result = self.run_deploy_script(&client.client_name, previous).await;
                match result {
                    Ok(()) => {
                        if let Ok(Some((host, port))) =
                            self.store.resolve_client_endpoint(&client.client_name).await
                        {
                            let _ = self.client.reload_configs(&host, port).await;
                        }
                        info!(client = %client.client_name, version = %previous, "rolled back client");
                    }
                    Err(e) => {
                        error!(client = %client.client_name, error = %e, "rollback failed for client");
                    }
                }
            }
            let _ = self
                .store
                .update_deployment_client_status(deployment_id, &client.client_name, "rolled_back", None)
                .await;
        }

        let _ = self
            .store
            .update_deployment_status(deployment_id, "rolled_back", None)
            .await;
    }
}

/// `(client, batch_number)` assignment: `batch_number = index / batch_size`.
fn batch_assignment(targets: &[String], batch_size: i64) -> Vec<(String, i64)> {
    targets
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i as i64 / batch_size))
        .collect()
}

fn group_batches(assignment: &[(String, i64)]) -> Vec<Vec<String>> {
    let mut batches: Vec<Vec<String>> = Vec::new();
    for (name, batch_num) in assignment {
        let idx = *batch_num as usize;
        while batches.len() <= idx {
            batches.push(Vec::new());
        }
        batches[idx].push(name.clone());
    }
    batches
}

fn rollback_set(clients: &[DeploymentClientStatus], failed_batch: i64) -> Vec<&DeploymentClientStatus> {
    clients
        .iter()
        .filter(|c| c.batch_number <= failed_batch && ROLLBACK_STATUSES.contains(&c.status.as_str()))
        .collect()
}

fn output_tail(bytes: &[u8]) -> Option<String> {
    let start = bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
    let text = String::from_utf8_lossy(&bytes[start..]).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn batch_assignment_floors_index_over_size() {
        let targets = names(&["a", "b", "c", "d", "e"]);
        let assignment = batch_assignment(&targets, 2);
        assert_eq!(
            assignment,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 0),
                ("c".to_string(), 1),
                ("d".to_string(), 1),
                ("e".to_string(), 2),
            ]
        );
    }

    #[test]
    fn group_batches_preserves_order() {
        let assignment = batch_assignment(&names(&["a", "b", "c"]), 2);
        let batches = group_batches(&assignment);
        assert_eq!(batches, vec![names(&["a", "b"]), names(&["c"])]);
    }

    #[test]
    fn single_batch_when_size_covers_targets() {
        let batches = group_batches(&batch_assignment(&names(&["a", "b"]), 10));
        assert_eq!(batches, vec![names(&["a", "b"])]);
    }

    #[test]
    fn rollback_set_filters_by_batch_and_status() {
        let make = |name: &str, batch: i64, status: &str| DeploymentClientStatus {
            client_name: name.to_string(),
            batch_number: batch,
            status: status.to_string(),
            previous_version: Some("v1".to_string()),
            started_at: None,
            completed_at: None,
            error: None,
        };
        let clients = vec![
            make("a", 0, "healthy"),
            make("b", 0, "pending"),
            make("c", 1, "failed"),
            make("d", 1, "deploying"),
            make("e", 2, "pending"),
            make("f", 2, "deployed"),
        ];
        let selected: Vec<&str> = rollback_set(&clients, 1)
            .into_iter()
            .map(|c| c.client_name.as_str())
            .collect();
        assert_eq!(selected, vec!["a", "c", "d"]);
    }

    #[test]
    fn output_tail_keeps_last_500_bytes() {
        let long = "x".repeat(1000);
        let tail = output_tail(long.as_bytes()).unwrap();
        assert_eq!(tail.len(), 500);
        assert!(output_tail(b"").is_none());
        assert_eq!(output_tail(b"  boom \n").as_deref(), Some("boom"));
    }
}
