//! Fleet routes — heartbeat intake, client queries, proxied node commands.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use super::CentralState;
use crate::fleet::{CommandResponse, HeartbeatPayload};

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": what})),
    )
        .into_response()
}

fn upstream_error(e: String) -> Response {
    (StatusCode::BAD_GATEWAY, Json(serde_json::json!({"error": e}))).into_response()
}

fn store_error(e: anyhow::Error) -> Response {
    warn!(error = %e, "fleet store error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "fleet store error"})),
    )
        .into_response()
}

/// Resolve a client's endpoint or answer 404.
async fn resolve(state: &CentralState, name: &str) -> Result<(String, u16), Response> {
    match state.store.resolve_client_endpoint(name).await {
        Ok(Some(endpoint)) => Ok(endpoint),
        Ok(None) => Err(not_found(&format!("Client not found: {}", name))),
        Err(e) => Err(store_error(e)),
    }
}

pub(super) async fn handler_heartbeat(
    State(state): State<Arc<CentralState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<HeartbeatPayload>,
) -> Response {
    let host = addr.ip().to_string();
    match state.store.upsert_heartbeat(&payload, &host).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => store_error(e),
    }
}

pub(super) async fn handler_list_clients(State(state): State<Arc<CentralState>>) -> Response {
    match state.store.list_clients().await {
        Ok(clients) => Json(clients).into_response(),
        Err(e) => store_error(e),
    }
}

pub(super) async fn handler_get_client(
    State(state): State<Arc<CentralState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.store.get_client(&name).await {
        Ok(Some(client)) => Json(client).into_response(),
        Ok(None) => not_found(&format!("Client not found: {}", name)),
        Err(e) => store_error(e),
    }
}

pub(super) async fn handler_client_workloads(
    State(state): State<Arc<CentralState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.store.get_workloads(&name).await {
        Ok(workloads) => Json(workloads).into_response(),
        Err(e) => store_error(e),
    }
}

pub(super) async fn handler_client_workload(
    State(state): State<Arc<CentralState>>,
    AxumPath((client, workload)): AxumPath<(String, String)>,
) -> Response {
    match state.store.get_workload(&client, &workload).await {
        Ok(Some(info)) => Json(info).into_response(),
        Ok(None) => not_found(&format!(
            "Workload '{}' not found on client '{}'",
            workload, client
        )),
        Err(e) => store_error(e),
    }
}

async fn proxy_command(
    state: &CentralState,
    client: &str,
    workload: &str,
    action: &str,
) -> Response {
    let (host, port) = match resolve(state, client).await {
        Ok(endpoint) => endpoint,
        Err(response) => return response,
    };
    let result: Result<CommandResponse, String> = match action {
        "start" => state.fleet_client.start_workload(&host, port, workload).await,
        "stop" => state.fleet_client.stop_workload(&host, port, workload).await,
        _ => state.fleet_client.restart_workload(&host, port, workload).await,
    };
    match result {
        Ok(response) => Json(response).into_response(),
        Err(e) => upstream_error(e),
    }
}

pub(super) async fn handler_workload_start(
    State(state): State<Arc<CentralState>>,
    AxumPath((client, workload)): AxumPath<(String, String)>,
) -> Response {
    proxy_command(&state, &client, &workload, "start").await
}

pub(super) async fn handler_workload_stop(
    State(state): State<Arc<CentralState>>,
    AxumPath((client, workload)): AxumPath<(String, String)>,
) -> Response {
    proxy_command(&state, &client, &workload, "stop").await
}

pub(super) async fn handler_workload_restart(
    State(state): State<Arc<CentralState>>,
    AxumPath((client, workload)): AxumPath<(String, String)>,
) -> Response {
    proxy_command(&state, &client, &workload, "restart").await
}

#[derive(Deserialize)]
pub(super) struct LogsQuery {
    lines: Option<u32>,
}

pub(super) async fn handler_workload_logs(
    State(state): State<Arc<CentralState>>,
    AxumPath((client, workload)): AxumPath<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let (host, port) = match resolve(&state, &client).await {
        Ok(endpoint) => endpoint,
        Err(response) => return response,
    };
    match state
        .fleet_client
        .get_logs(&host, port, &workload, query.lines.unwrap_or(50))
        .await
    {
        Ok(body) => Json(body).into_response(),
        Err(e) => upstream_error(e),
    }
}

pub(super) async fn handler_client_reload(
    State(state): State<Arc<CentralState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let (host, port) = match resolve(&state, &name).await {
        Ok(endpoint) => endpoint,
        Err(response) => return response,
    };
    match state.fleet_client.reload_configs(&host, port).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => upstream_error(e),
    }
}
