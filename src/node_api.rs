//! # Node API — HTTP Surface of One Supervisor
//!
//! Mirrors the local command socket over HTTP so the controller (and
//! operators) can drive a node remotely, plus a log-tail endpoint.
//! `GET /api/health` stays open; everything else requires the shared
//! bearer token when one is configured.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path as AxumPath, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::fleet::CommandResponse;
use crate::orchestrator::OrchestratorHandle;

const MAX_LOG_LINES: u32 = 10_000;
const DEFAULT_LOG_LINES: u32 = 50;

pub struct NodeApiState {
    pub handle: OrchestratorHandle,
    pub api_token: Option<String>,
    pub log_dir: Option<PathBuf>,
}

pub fn build_router(state: Arc<NodeApiState>) -> Router {
    Router::new()
        .route("/api/health", get(handler_health))
        .route("/api/list", get(handler_list))
        .route("/api/status/{name}", get(handler_status))
        .route("/api/start/{name}", post(handler_start))
        .route("/api/stop/{name}", post(handler_stop))
        .route("/api/restart/{name}", post(handler_restart))
        .route("/api/reload", post(handler_reload))
        .route("/api/logs/{name}", get(handler_logs))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth))
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

pub async fn serve(state: Arc<NodeApiState>, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(host, port, "fleet http api started");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Static bearer-token comparison; the health endpoint stays open so the
/// deployer can gate on it without credentials.
async fn auth(
    State(state): State<Arc<NodeApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = &state.api_token else {
        return next.run(request).await;
    };
    if request.uri().path() == "/api/health" {
        return next.run(request).await;
    }
    let expected = format!("Bearer {}", token);
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Unauthorized"})),
        )
            .into_response()
    }
}

async fn handler_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handler_list(State(state): State<Arc<NodeApiState>>) -> impl IntoResponse {
    let states = state.handle.list_workloads().await;
    Json(serde_json::json!({
        "workloads": states.iter().map(|s| s.summary()).collect::<Vec<_>>(),
    }))
}

async fn handler_status(
    State(state): State<Arc<NodeApiState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.handle.status(&name).await {
        Some(workload) => Json(workload.detail()).into_response(),
        None => not_found(&name),
    }
}

async fn handler_start(
    State(state): State<Arc<NodeApiState>>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    let message = state.handle.start_workload(&name).await;
    Json(CommandResponse {
        success: message.starts_with("Started"),
        message,
    })
}

async fn handler_stop(
    State(state): State<Arc<NodeApiState>>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    let message = state.handle.stop_workload(&name).await;
    Json(CommandResponse {
        success: message.starts_with("Stopped"),
        message,
    })
}

async fn handler_restart(
    State(state): State<Arc<NodeApiState>>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    let message = state.handle.restart_workload(&name).await;
    Json(CommandResponse {
        success: message.starts_with("Started"),
        message,
    })
}

async fn handler_reload(State(state): State<Arc<NodeApiState>>) -> Response {
    match state.handle.reload_configs().await {
        Ok(changes) => Json(serde_json::json!({"success": true, "changes": changes})).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    lines: Option<u32>,
}

async fn handler_logs(
    State(state): State<Arc<NodeApiState>>,
    AxumPath(name): AxumPath<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    if lines == 0 || lines > MAX_LOG_LINES {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("lines must be between 1 and {}", MAX_LOG_LINES),
            })),
        )
            .into_response();
    }
    if state.handle.status(&name).await.is_none() {
        return not_found(&name);
    }

    let Some(log_dir) = &state.log_dir else {
        return Json(serde_json::json!({"name": name, "lines": []})).into_response();
    };
    let log_file = log_dir.join(format!("{}.log", name));
    let tail: Vec<String> = match std::fs::read_to_string(&log_file) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines as usize);
            all[start..].iter().map(|l| l.to_string()).collect()
        }
        Err(_) => Vec::new(),
    };
    Json(serde_json::json!({"name": name, "lines": tail})).into_response()
}

fn not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("Unknown workload: {}", name)})),
    )
        .into_response()
}
