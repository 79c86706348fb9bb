//! # CLI — Subcommand Bodies
//!
//! The daemon and central runners wire components together; the remaining
//! verbs are thin clients over the local command socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info};

use mctl::central;
use mctl::config::daemon::DaemonConfig;
use mctl::db::Database;
use mctl::health::{HealthChecker, DEFAULT_INTERVAL};
use mctl::heartbeat::HeartbeatReporter;
use mctl::ipc;
use mctl::node_api::{self, NodeApiState};
use mctl::orchestrator::Orchestrator;
use mctl::plugins::PluginRegistry;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-task drain bound at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Run the per-node supervisor until a shutdown command or signal.
pub async fn run_daemon(
    config_dir: PathBuf,
    db_path: PathBuf,
    log_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
) -> Result<()> {
    let daemon_config = DaemonConfig::load(&config_dir)?;
    let db = Database::open(&db_path)
        .await
        .with_context(|| format!("opening node database {}", db_path.display()))?;
    let mut plugins = PluginRegistry::new();
    plugins.discover();

    let (mut orch, handle) = Orchestrator::new(
        config_dir.clone(),
        db,
        log_dir.clone(),
        &daemon_config,
        Arc::new(plugins),
    );
    orch.boot().await?;

    let socket_path = socket_path.unwrap_or_else(ipc::default_socket_path);
    let listener = ipc::bind(&socket_path)?;

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    background.push(tokio::spawn(ipc::serve(listener, handle.clone())));
    background.push(tokio::spawn(
        HealthChecker::new(handle.clone(), DEFAULT_INTERVAL).run(),
    ));

    if daemon_config.fleet.enabled {
        let fleet = daemon_config.fleet.clone();
        let state = Arc::new(NodeApiState {
            handle: handle.clone(),
            api_token: fleet.api_token.clone(),
            log_dir: log_dir.clone(),
        });
        let api_host = fleet.api_host.clone();
        let api_port = fleet.api_port;
        background.push(tokio::spawn(async move {
            if let Err(e) = node_api::serve(state, &api_host, api_port).await {
                error!(error = %e, "fleet http api failed");
            }
        }));
        if let Some(reporter) = HeartbeatReporter::new(handle.clone(), &fleet) {
            background.push(tokio::spawn(reporter.run()));
        }
    }

    let signal_handle = handle.clone();
    background.push(tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        signal_handle.shutdown().await;
    }));

    // Runs until a shutdown command arrives via socket, API, or signal.
    orch.run().await;

    for task in background {
        task.abort();
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN, task).await;
    }
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

/// Run the central controller until a signal.
pub async fn run_central(config_dir: PathBuf) -> Result<()> {
    let daemon_config = DaemonConfig::load(&config_dir)?;
    let central_config = daemon_config.central;
    tokio::select! {
        result = central::run(&central_config) => result,
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("signal handler installation");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Send one socket command and print the response.
pub async fn run_socket_command(socket_path: Option<PathBuf>, command: Value) -> Result<()> {
    let socket_path = socket_path.unwrap_or_else(ipc::default_socket_path);
    let response = ipc::send_command(&socket_path, command, SOCKET_TIMEOUT).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if let Some(error) = response.get("error").and_then(|e| e.as_str()) {
        bail!("{}", error);
    }
    Ok(())
}

pub fn command_value(verb: &str, name: Option<&str>) -> Value {
    match name {
        Some(name) => json!({"command": verb, "name": name}),
        None => json!({"command": verb}),
    }
}

/// Default worker launcher body. The argv contract is the real interface;
/// this shim execs the module as a child with the workload context in its
/// environment and mirrors its exit code.
pub fn run_worker(
    module: &str,
    entry_point: &str,
    params_json: &str,
    workload_name: &str,
    log_file: Option<&PathBuf>,
) -> Result<()> {
    let mut cmd = std::process::Command::new(module);
    cmd.env("MCTL_ENTRY_POINT", entry_point)
        .env("MCTL_PARAMS_JSON", params_json)
        .env("MCTL_WORKLOAD_NAME", workload_name);
    if let Some(path) = log_file {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        cmd.stdout(log.try_clone()?);
        cmd.stderr(log);
    }
    let status = cmd
        .status()
        .with_context(|| format!("launching workload module '{}'", module))?;
    std::process::exit(status.code().unwrap_or(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_value_shapes() {
        assert_eq!(command_value("list", None), json!({"command": "list"}));
        assert_eq!(
            command_value("stop", Some("etl")),
            json!({"command": "stop", "name": "etl"})
        );
    }
}
