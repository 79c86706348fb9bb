//! # Central — Fleet Controller HTTP Application
//!
//! Aggregates node heartbeats into the fleet store, proxies workload
//! commands to nodes, and drives rolling deployments. One axum app plus
//! one background loop (the stale reaper) that flips silent clients to
//! offline.

mod auth;
mod routes_deployments;
mod routes_fleet;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::config::daemon::CentralConfig;
use crate::fleet::deployer::RollingDeployer;
use crate::fleet::http_client::FleetHttpClient;
use crate::fleet::store::FleetStore;

pub struct CentralState {
    pub store: FleetStore,
    pub fleet_client: FleetHttpClient,
    pub deployer: RollingDeployer,
    pub api_token: Option<String>,
}

pub fn build_router(state: Arc<CentralState>) -> Router {
    Router::new()
        .route("/api/heartbeat", post(routes_fleet::handler_heartbeat))
        .route("/api/fleet/clients", get(routes_fleet::handler_list_clients))
        .route("/api/fleet/clients/{name}", get(routes_fleet::handler_get_client))
        .route(
            "/api/fleet/clients/{name}/workloads",
            get(routes_fleet::handler_client_workloads),
        )
        .route(
            "/api/fleet/clients/{client}/workloads/{workload}",
            get(routes_fleet::handler_client_workload),
        )
        .route(
            "/api/fleet/clients/{client}/workloads/{workload}/start",
            post(routes_fleet::handler_workload_start),
        )
        .route(
            "/api/fleet/clients/{client}/workloads/{workload}/stop",
            post(routes_fleet::handler_workload_stop),
        )
        .route(
            "/api/fleet/clients/{client}/workloads/{workload}/restart",
            post(routes_fleet::handler_workload_restart),
        )
        .route(
            "/api/fleet/clients/{client}/workloads/{workload}/logs",
            get(routes_fleet::handler_workload_logs),
        )
        .route(
            "/api/fleet/clients/{name}/reload",
            post(routes_fleet::handler_client_reload),
        )
        .route(
            "/api/fleet/deployments",
            get(routes_deployments::handler_list_deployments)
                .post(routes_deployments::handler_create_deployment),
        )
        .route(
            "/api/fleet/deployments/{id}",
            get(routes_deployments::handler_get_deployment),
        )
        .route(
            "/api/fleet/deployments/{id}/cancel",
            post(routes_deployments::handler_cancel_deployment),
        )
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth::require_token))
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Pre-register inventory clients so the controller can address a node
/// before its first heartbeat. Heartbeats outrank these rows.
async fn seed_from_inventory(store: &FleetStore, path: &std::path::Path) {
    if !path.exists() {
        return;
    }
    match crate::config::inventory::Inventory::load(path) {
        Ok(inventory) => {
            let clients = inventory.resolve();
            for client in &clients {
                if let Err(e) = store
                    .register_discovered_client(&client.name, &client.host, client.api_port)
                    .await
                {
                    warn!(client = %client.name, error = %e, "inventory registration failed");
                }
            }
            info!(count = clients.len(), "seeded clients from inventory");
        }
        Err(e) => warn!(error = %e, "inventory load failed"),
    }
}

/// Background sweep flipping silent clients offline. Half-threshold
/// cadence keeps detection latency under one threshold.
pub fn spawn_stale_reaper(store: FleetStore, threshold_seconds: f64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs_f64((threshold_seconds / 2.0).max(1.0));
        loop {
            tokio::time::sleep(interval).await;
            match store.mark_stale_clients(threshold_seconds).await {
                Ok(count) if count > 0 => info!(count, "marked clients offline"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "stale check error"),
            }
        }
    })
}

/// Assemble state from config, start the reaper, serve until cancelled.
pub async fn run(config: &CentralConfig) -> Result<()> {
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("fleet.db"));
    let store = FleetStore::open(&db_path).await?;
    let inventory_path = config
        .inventory_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("inventory.yaml"));
    seed_from_inventory(&store, &inventory_path).await;
    let fleet_client = FleetHttpClient::new(config.api_token.as_deref());
    let deployer = RollingDeployer::new(
        store.clone(),
        fleet_client.clone(),
        config
            .deploy_script_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("scripts/deploy-clients.sh")),
        inventory_path,
    );
    let state = Arc::new(CentralState {
        store: store.clone(),
        fleet_client,
        deployer,
        api_token: config.api_token.clone(),
    });

    let reaper = spawn_stale_reaper(store, config.stale_threshold_seconds);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(host = %config.host, port = config.port, "central api started");
    let result = axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;
    reaper.abort();
    result?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::serve_central;
    use super::*;
    use crate::db::now_iso;
    use crate::fleet::HeartbeatPayload;

    #[tokio::test]
    async fn heartbeat_endpoint_upserts_client() {
        let (base, store, _state, server) =
            serve_central(None, PathBuf::from("/bin/true")).await;
        let payload = HeartbeatPayload {
            client_name: "pi-1".to_string(),
            timestamp: now_iso(),
            deployed_version: Some("v1".to_string()),
            workloads: Vec::new(),
            system: Default::default(),
        };
        let resp = reqwest::Client::new()
            .post(format!("{}/api/heartbeat", base))
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");

        let client = store.get_client("pi-1").await.unwrap().unwrap();
        assert_eq!(client.status, "online");
        assert_eq!(client.host, "127.0.0.1", "host falls back to peer address");
        server.abort();
    }

    #[tokio::test]
    async fn token_gates_the_whole_api_including_heartbeat() {
        let (base, _store, _state, server) =
            serve_central(Some("sekrit"), PathBuf::from("/bin/true")).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/api/fleet/clients", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let payload = serde_json::json!({"client_name": "pi-1", "timestamp": now_iso()});
        let resp = client
            .post(format!("{}/api/heartbeat", base))
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .get(format!("{}/api/fleet/clients", base))
            .header("Authorization", "Bearer sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        server.abort();
    }

    #[tokio::test]
    async fn inventory_seeds_discovered_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.yaml");
        std::fs::write(
            &path,
            "defaults:\n  api_port: 9100\nclients:\n  - host: 10.0.0.11\n    name: pi-1\n  - host: 10.0.0.12\n    api_port: 9200\n",
        )
        .unwrap();
        let store = FleetStore::open_in_memory().await.unwrap();
        seed_from_inventory(&store, &path).await;

        let pi1 = store.get_client("pi-1").await.unwrap().unwrap();
        assert_eq!(pi1.status, "discovered");
        assert_eq!(pi1.host, "10.0.0.11");
        assert_eq!(
            store.resolve_client_endpoint("10.0.0.12").await.unwrap(),
            Some(("10.0.0.12".to_string(), 9200))
        );
    }

    #[tokio::test]
    async fn unknown_client_is_404() {
        let (base, _store, _state, server) =
            serve_central(None, PathBuf::from("/bin/true")).await;
        let resp = reqwest::get(format!("{}/api/fleet/clients/ghost", base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        server.abort();
    }

    #[tokio::test]
    async fn command_proxy_to_unreachable_node_is_502() {
        let (base, store, _state, server) =
            serve_central(None, PathBuf::from("/bin/true")).await;
        // Known client with a dead endpoint.
        store
            .register_discovered_client("pi-1", "127.0.0.1", 9)
            .await
            .unwrap();
        let resp = reqwest::Client::new()
            .post(format!("{}/api/fleet/clients/pi-1/workloads/etl/start", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        server.abort();
    }
}
