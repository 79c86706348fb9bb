//! Deployment routes — create, inspect, cancel rolling deployments.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use super::CentralState;
use crate::fleet::deployer::DeployError;
use crate::fleet::DeploymentRequest;

pub(super) async fn handler_create_deployment(
    State(state): State<Arc<CentralState>>,
    Json(request): Json<DeploymentRequest>,
) -> Response {
    if request.version.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "version must not be empty"})),
        )
            .into_response();
    }
    match state.deployer.start_deployment(request).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"id": id, "status": "pending"})),
        )
            .into_response(),
        Err(DeployError::NoTargets) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": DeployError::NoTargets.to_string()})),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "deployment creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
pub(super) struct ListQuery {
    limit: Option<i64>,
}

pub(super) async fn handler_list_deployments(
    State(state): State<Arc<CentralState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    match state.store.list_deployments(limit).await {
        Ok(deployments) => Json(deployments).into_response(),
        Err(e) => {
            warn!(error = %e, "deployment list failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "fleet store error"})),
            )
                .into_response()
        }
    }
}

pub(super) async fn handler_get_deployment(
    State(state): State<Arc<CentralState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.store.get_deployment(&id).await {
        Ok(Some(deployment)) => Json(deployment).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("Deployment not found: {}", id)})),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "deployment read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "fleet store error"})),
            )
                .into_response()
        }
    }
}

pub(super) async fn handler_cancel_deployment(
    State(state): State<Arc<CentralState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.deployer.cancel_deployment(&id).await {
        Ok(()) => Json(serde_json::json!({"id": id, "status": "failed"})).into_response(),
        Err(DeployError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("Deployment not found: {}", id)})),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "deployment cancel failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}
