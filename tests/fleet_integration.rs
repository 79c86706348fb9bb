//! Full-loop fleet test: a real node daemon (orchestrator, node API,
//! heartbeat reporter) reporting into a real central app, and controller
//! commands proxied back down to the node.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mctl::central::{build_router, CentralState};
use mctl::config::daemon::{DaemonConfig, FleetConfig};
use mctl::db::Database;
use mctl::fleet::deployer::RollingDeployer;
use mctl::fleet::http_client::FleetHttpClient;
use mctl::fleet::store::FleetStore;
use mctl::heartbeat::HeartbeatReporter;
use mctl::node_api::{build_router as build_node_router, NodeApiState};
use mctl::orchestrator::{Orchestrator, OrchestratorHandle};
use mctl::plugins::PluginRegistry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct TestCentral {
    base: String,
    store: FleetStore,
    server: JoinHandle<()>,
}

async fn start_central() -> TestCentral {
    let store = FleetStore::open_in_memory().await.unwrap();
    let fleet_client = FleetHttpClient::with_timeout(None, Duration::from_secs(2));
    let deployer = RollingDeployer::new(
        store.clone(),
        fleet_client.clone(),
        PathBuf::from("/bin/true"),
        PathBuf::from("inventory.yaml"),
    );
    let state = Arc::new(CentralState {
        store: store.clone(),
        fleet_client,
        deployer,
        api_token: None,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(state);
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    TestCentral {
        base: format!("http://{}", addr),
        store,
        server,
    }
}

struct TestNode {
    handle: OrchestratorHandle,
    port: u16,
    tasks: Vec<JoinHandle<()>>,
}

async fn start_node(config_dir: &Path, central_url: Option<&str>) -> TestNode {
    let db = Database::open_in_memory().await.unwrap();
    let mut plugins = PluginRegistry::new();
    plugins.discover();
    let daemon_config = DaemonConfig {
        worker_command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 30".to_string(),
        ]),
        ..Default::default()
    };
    let (mut orch, handle) = Orchestrator::new(
        config_dir.to_path_buf(),
        db,
        None,
        &daemon_config,
        Arc::new(plugins),
    );
    orch.boot().await.unwrap();
    let orch_task = tokio::spawn(orch.run());

    let state = Arc::new(NodeApiState {
        handle: handle.clone(),
        api_token: None,
        log_dir: None,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let api_task = tokio::spawn(async move {
        axum::serve(listener, build_node_router(state)).await.unwrap();
    });

    let mut tasks = vec![orch_task, api_task];
    if let Some(url) = central_url {
        let fleet_config = FleetConfig {
            enabled: true,
            client_name: Some("pi-1".to_string()),
            central_api_url: Some(url.to_string()),
            heartbeat_interval_seconds: 1.0,
            ..Default::default()
        };
        let reporter = HeartbeatReporter::new(handle.clone(), &fleet_config).unwrap();
        tasks.push(tokio::spawn(reporter.run()));
    }

    TestNode { handle, port, tasks }
}

async fn wait_for_online(store: &FleetStore, name: &str) {
    for _ in 0..100 {
        if let Some(client) = store.get_client(name).await.unwrap() {
            if client.status == "online" {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("client '{}' never came online", name);
}

#[tokio::test]
async fn heartbeats_populate_the_fleet_store() {
    let central = start_central().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("alpha.yaml"),
        "name: alpha\ntype: service\nrun_mode: forever\nmodule: svc.alpha\nrestart_delay: 0.1\n",
    )
    .unwrap();
    let node = start_node(dir.path(), Some(&central.base)).await;

    wait_for_online(&central.store, "pi-1").await;

    let client = central.store.get_client("pi-1").await.unwrap().unwrap();
    assert_eq!(client.host, "127.0.0.1");
    assert_eq!(client.workload_count, 1);
    assert!(client.system.is_some());
    assert!(client.last_seen.is_some());

    let workloads = central.store.get_workloads("pi-1").await.unwrap();
    assert_eq!(workloads.len(), 1);
    assert_eq!(workloads[0].name, "alpha");
    assert_eq!(workloads[0].workload_type, "service");

    // The controller API serves the same view.
    let body: serde_json::Value = reqwest::get(format!("{}/api/fleet/clients", central.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body[0]["name"], "pi-1");
    assert_eq!(body[0]["status"], "online");

    node.handle.shutdown().await;
    for task in node.tasks {
        task.abort();
    }
    central.server.abort();
}

#[tokio::test]
async fn controller_commands_proxy_to_the_node() {
    let central = start_central().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("alpha.yaml"),
        "name: alpha\ntype: service\nrun_mode: forever\nmodule: svc.alpha\nrestart_delay: 0.1\n",
    )
    .unwrap();
    // No heartbeat reporter here: command proxying needs only the
    // endpoint row, and a discovered client resolves like any other.
    let node = start_node(dir.path(), None).await;
    central
        .store
        .register_discovered_client("pi-1", "127.0.0.1", node.port)
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .post(format!(
            "{}/api/fleet/clients/pi-1/workloads/alpha/stop",
            central.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert!(body["message"].as_str().unwrap().contains("Stopped"));

    // The node really stopped it.
    let state = node.handle.status("alpha").await.unwrap();
    assert_eq!(state.status.as_str(), "stopped");

    let body: serde_json::Value = client
        .post(format!(
            "{}/api/fleet/clients/pi-1/workloads/alpha/start",
            central.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);

    node.handle.shutdown().await;
    for task in node.tasks {
        task.abort();
    }
    central.server.abort();
}

#[tokio::test]
async fn stale_then_fresh_heartbeat_round_trips_status() {
    let central = start_central().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("alpha.yaml"),
        "name: alpha\ntype: service\nrun_mode: forever\nmodule: svc.alpha\nrestart_delay: 0.1\n",
    )
    .unwrap();
    let node = start_node(dir.path(), Some(&central.base)).await;
    wait_for_online(&central.store, "pi-1").await;

    // Backdate the heartbeat two minutes; the reaper sweep marks offline.
    let old = (chrono::Utc::now() - chrono::Duration::seconds(120))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    sqlx::query("UPDATE fleet_clients SET last_seen = ? WHERE name = 'pi-1'")
        .bind(&old)
        .execute(central.store.pool())
        .await
        .unwrap();
    assert_eq!(central.store.mark_stale_clients(60.0).await.unwrap(), 1);
    assert_eq!(
        central.store.get_client("pi-1").await.unwrap().unwrap().status,
        "offline"
    );

    // The reporter's next beat restores online.
    wait_for_online(&central.store, "pi-1").await;

    node.handle.shutdown().await;
    for task in node.tasks {
        task.abort();
    }
    central.server.abort();
}
