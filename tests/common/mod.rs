//! # Mock Node — Simulated Supervisor HTTP Server for Tests
//!
//! A lightweight in-process stand-in for a node daemon's HTTP API, used to
//! test the controller side (deployer, command proxying) without real
//! supervised processes.
//!
//! | Method | Path             | Behavior                                |
//! |--------|------------------|-----------------------------------------|
//! | GET    | `/api/health`    | configurable `{status: ...}`            |
//! | POST   | `/api/reload`    | records the call, `{success: true}`     |
//! | POST   | `/api/start/{n}` | records the call, `{success: true}`     |
//! | POST   | `/api/stop/{n}`  | records the call, `{success: true}`     |
//!
//! All shared state is behind `Arc<Mutex<...>>`; tests read back what the
//! controller actually sent.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct MockNodeState {
    /// Value returned in the health body's `status` field.
    pub health_status: String,
    /// Request log: "reload", "start etl", ...
    pub requests: Vec<String>,
}

#[derive(Clone)]
pub struct MockNode {
    state: Arc<Mutex<MockNodeState>>,
    pub addr: SocketAddr,
    handle: Arc<tokio::task::JoinHandle<()>>,
}

impl MockNode {
    /// Bind an ephemeral port and serve until dropped.
    pub async fn start(health_status: &str) -> Self {
        let state = Arc::new(Mutex::new(MockNodeState {
            health_status: health_status.to_string(),
            requests: Vec::new(),
        }));
        let router = Router::new()
            .route("/api/health", get(handler_health))
            .route("/api/reload", post(handler_reload))
            .route("/api/start/{name}", post(handler_start))
            .route("/api/stop/{name}", post(handler_stop))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        MockNode {
            state,
            addr,
            handle: Arc::new(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_health_status(&self, status: &str) {
        self.state.lock().unwrap().health_status = status.to_string();
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn reload_count(&self) -> usize {
        self.requests().iter().filter(|r| *r == "reload").count()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handler_health(State(state): State<Arc<Mutex<MockNodeState>>>) -> Json<serde_json::Value> {
    let status = state.lock().unwrap().health_status.clone();
    Json(serde_json::json!({"status": status, "version": "test"}))
}

async fn handler_reload(State(state): State<Arc<Mutex<MockNodeState>>>) -> Json<serde_json::Value> {
    state.lock().unwrap().requests.push("reload".to_string());
    Json(serde_json::json!({"success": true, "changes": {}}))
}

async fn handler_start(
    State(state): State<Arc<Mutex<MockNodeState>>>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    state.lock().unwrap().requests.push(format!("start {}", name));
    Json(serde_json::json!({"success": true, "message": format!("Started '{}'", name)}))
}

async fn handler_stop(
    State(state): State<Arc<Mutex<MockNodeState>>>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    state.lock().unwrap().requests.push(format!("stop {}", name));
    Json(serde_json::json!({"success": true, "message": format!("Stopped '{}'", name)}))
}
