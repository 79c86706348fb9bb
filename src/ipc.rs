//! # Local Command Socket — Line-Delimited JSON Over a Unix Socket
//!
//! One request per connection: the client writes a single JSON object and
//! a newline, the daemon answers with one JSON line and closes. The CLI
//! subcommands are thin wrappers over [`send_command`].
//!
//! ## Protocol
//!
//! Request: `{"command": "<verb>", "name": "<workload>"}` (name optional).
//! Verbs: `list`, `status`, `start`, `stop`, `restart`, `reload`,
//! `shutdown`. Anything else answers `{"error": "Unknown command: <c>"}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::orchestrator::OrchestratorHandle;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Daemon is not running. Start it with: mctl daemon")]
    NotRunning,
    #[error("socket error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Default per-user socket path.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("mctl.sock")
}

/// Bind the listening socket, clearing a stale file from a previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(socket = %path.display(), "ipc server listening");
    Ok(listener)
}

/// Accept loop; runs until the task is cancelled at shutdown.
pub async fn serve(listener: UnixListener, handle: OrchestratorHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handle).await {
                        warn!(error = %e, "ipc connection error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "ipc accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handle: OrchestratorHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<Value>(&line) {
        Ok(request) => dispatch(&request, &handle).await,
        Err(e) => json!({"error": format!("invalid request: {}", e)}),
    };

    let mut out = serde_json::to_vec(&response)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Map one request to one response. Mirrored by the node HTTP API.
pub async fn dispatch(request: &Value, handle: &OrchestratorHandle) -> Value {
    let cmd = request.get("command").and_then(|c| c.as_str());
    let name = request.get("name").and_then(|n| n.as_str());

    match (cmd, name) {
        (Some("list"), _) => {
            let states = handle.list_workloads().await;
            json!({"workloads": states.iter().map(|s| s.summary()).collect::<Vec<_>>()})
        }
        (Some("status"), Some(name)) => match handle.status(name).await {
            Some(state) => state.detail(),
            None => json!({"error": format!("Unknown workload: {}", name)}),
        },
        (Some("start"), Some(name)) => json!({"message": handle.start_workload(name).await}),
        (Some("stop"), Some(name)) => json!({"message": handle.stop_workload(name).await}),
        (Some("restart"), Some(name)) => json!({"message": handle.restart_workload(name).await}),
        (Some("reload"), _) => match handle.reload_configs().await {
            Ok(summary) => json!({"changes": summary}),
            Err(e) => json!({"error": e}),
        },
        (Some("shutdown"), _) => {
            handle.shutdown().await;
            json!({"message": "Shutting down"})
        }
        (cmd, _) => json!({"error": format!("Unknown command: {}", cmd.unwrap_or("<none>"))}),
    }
}

/// Client side: one request, one response.
pub async fn send_command(socket_path: &Path, command: Value, timeout: Duration) -> Result<Value, IpcError> {
    if !socket_path.exists() {
        return Err(IpcError::NotRunning);
    }
    let connect = UnixStream::connect(socket_path);
    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| IpcError::Io("connect timed out".to_string()))?
        .map_err(|_| IpcError::NotRunning)?;

    let (reader, mut writer) = stream.into_split();
    let mut out = serde_json::to_vec(&command).map_err(|e| IpcError::Protocol(e.to_string()))?;
    out.push(b'\n');
    writer
        .write_all(&out)
        .await
        .map_err(|e| IpcError::Io(e.to_string()))?;

    let mut line = String::new();
    let mut reader = BufReader::new(reader);
    tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| IpcError::Io("response timed out".to_string()))?
        .map_err(|e| IpcError::Io(e.to_string()))?;
    if line.trim().is_empty() {
        return Err(IpcError::Protocol("empty response from daemon".to_string()));
    }
    serde_json::from_str(&line).map_err(|e| IpcError::Protocol(e.to_string()))
}
