//! # Orchestrator — Single-Writer Coordinator for One Node
//!
//! Owns the registry, the runners, the cron schedule, and the plugin
//! registry. Every mutation funnels through a command mailbox consumed by
//! one task, so the socket server, the node HTTP API, the health checker,
//! and the signal handler never touch shared mutable state directly: they
//! post a [`Command`] through an [`OrchestratorHandle`] and await the
//! reply.
//!
//! ```text
//! socket ──┐
//! http   ──┼─► mpsc mailbox ─► orchestrator task ─► registry/runners
//! health ──┤                        │ 1 Hz tick ──► scheduler.due()
//! signal ──┘                        └────────────► run_scheduled()
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::daemon::DaemonConfig;
use crate::config::loader::ConfigLoader;
use crate::config::version::read_deployed_version;
use crate::db::Database;
use crate::plugins::PluginRegistry;
use crate::registry::WorkloadRegistry;
use crate::runner::{RunnerContext, WorkloadRunner};
use crate::scheduler::ScheduleManager;
use crate::workload::{RunMode, WorkloadState};

/// Per-stop graceful-termination bound, matching the socket contract.
const STOP_TIMEOUT_SECS: f64 = 10.0;

/// Outcome of a reload: the four reconciliation sets, name-sorted.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub unchanged: Vec<String>,
}

enum Command {
    Start {
        name: String,
        reply: oneshot::Sender<String>,
    },
    Stop {
        name: String,
        reply: oneshot::Sender<String>,
    },
    Restart {
        name: String,
        reply: oneshot::Sender<String>,
    },
    Status {
        name: String,
        reply: oneshot::Sender<Option<WorkloadState>>,
    },
    List {
        reply: oneshot::Sender<Vec<WorkloadState>>,
    },
    Reload {
        reply: oneshot::Sender<Result<ReloadSummary, String>>,
    },
    MarkFailed {
        name: String,
        error: String,
    },
    DeployedVersion {
        reply: oneshot::Sender<Option<String>>,
    },
    Shutdown,
}

/// Cloneable mailbox front-end. Every method is safe to call from any
/// task; a closed mailbox (daemon shutting down) degrades to error
/// messages / empty results.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
        fallback: T,
    ) -> T {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(make(reply)).await.is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }

    pub async fn start_workload(&self, name: &str) -> String {
        let name = name.to_string();
        self.request(
            |reply| Command::Start { name, reply },
            "daemon is shutting down".to_string(),
        )
        .await
    }

    pub async fn stop_workload(&self, name: &str) -> String {
        let name = name.to_string();
        self.request(
            |reply| Command::Stop { name, reply },
            "daemon is shutting down".to_string(),
        )
        .await
    }

    pub async fn restart_workload(&self, name: &str) -> String {
        let name = name.to_string();
        self.request(
            |reply| Command::Restart { name, reply },
            "daemon is shutting down".to_string(),
        )
        .await
    }

    pub async fn status(&self, name: &str) -> Option<WorkloadState> {
        let name = name.to_string();
        self.request(|reply| Command::Status { name, reply }, None).await
    }

    pub async fn list_workloads(&self) -> Vec<WorkloadState> {
        self.request(|reply| Command::List { reply }, Vec::new()).await
    }

    pub async fn reload_configs(&self) -> Result<ReloadSummary, String> {
        self.request(
            |reply| Command::Reload { reply },
            Err("daemon is shutting down".to_string()),
        )
        .await
    }

    pub async fn mark_failed(&self, name: &str, error: &str) {
        let _ = self
            .tx
            .send(Command::MarkFailed {
                name: name.to_string(),
                error: error.to_string(),
            })
            .await;
    }

    pub async fn deployed_version(&self) -> Option<String> {
        self.request(|reply| Command::DeployedVersion { reply }, None)
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

pub struct Orchestrator {
    config_dir: PathBuf,
    db: Database,
    registry: WorkloadRegistry,
    scheduler: ScheduleManager,
    runners: HashMap<String, WorkloadRunner>,
    plugins: Arc<PluginRegistry>,
    runner_ctx: RunnerContext,
    deployed_version: Option<String>,
    rx: mpsc::Receiver<Command>,
}

impl Orchestrator {
    pub fn new(
        config_dir: PathBuf,
        db: Database,
        log_dir: Option<PathBuf>,
        daemon_config: &DaemonConfig,
        plugins: Arc<PluginRegistry>,
    ) -> (Self, OrchestratorHandle) {
        let runner_ctx = match &daemon_config.worker_command {
            Some(words) if !words.is_empty() => RunnerContext {
                worker_command: words.clone(),
                log_dir: log_dir.clone(),
            },
            _ => RunnerContext::from_current_exe(log_dir.clone()),
        };
        let (tx, rx) = mpsc::channel(64);
        let orch = Orchestrator {
            config_dir,
            db,
            registry: WorkloadRegistry::new(),
            scheduler: ScheduleManager::new(),
            runners: HashMap::new(),
            plugins,
            runner_ctx,
            deployed_version: None,
            rx,
        };
        (orch, OrchestratorHandle { tx })
    }

    /// Boot: read the version marker, load configs, register and start
    /// every workload per its run mode.
    pub async fn boot(&mut self) -> Result<()> {
        info!(config_dir = %self.config_dir.display(), "orchestrator starting");
        self.deployed_version = read_deployed_version(&self.config_dir);

        let known = self.plugins.known_workload_types();
        let specs = ConfigLoader::new(&self.config_dir).load_all(Some(&known))?;
        self.validate_plugin_params(&specs)
            .map_err(|e| anyhow::anyhow!(e))?;
        let count = specs.len();
        for spec in specs {
            self.registry.register(spec)?;
        }
        info!(count, "loaded workloads");

        for name in self.registry.names() {
            self.spawn_runner(&name).await;
        }
        info!("orchestrator ready");
        Ok(())
    }

    /// Consume the mailbox until shutdown, ticking the scheduler once per
    /// second between commands.
    pub async fn run(mut self) {
        let tick_period = Duration::from_secs(1);
        let mut next_tick = tokio::time::Instant::now() + tick_period;
        loop {
            if tokio::time::Instant::now() >= next_tick {
                self.tick_schedules().await;
                next_tick = tokio::time::Instant::now() + tick_period;
            }
            match tokio::time::timeout_at(next_tick, self.rx.recv()).await {
                Ok(Some(Command::Shutdown)) | Ok(None) => break,
                Ok(Some(cmd)) => self.handle(cmd).await,
                Err(_) => {
                    self.tick_schedules().await;
                    next_tick = tokio::time::Instant::now() + tick_period;
                }
            }
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start { name, reply } => {
                let _ = reply.send(self.start_workload(&name).await);
            }
            Command::Stop { name, reply } => {
                let _ = reply.send(self.stop_workload(&name).await);
            }
            Command::Restart { name, reply } => {
                self.stop_workload(&name).await;
                let _ = reply.send(self.start_workload(&name).await);
            }
            Command::Status { name, reply } => {
                let _ = reply.send(self.get_status(&name));
            }
            Command::List { reply } => {
                let _ = reply.send(self.list_workloads());
            }
            Command::Reload { reply } => {
                let _ = reply.send(self.reload_configs().await);
            }
            Command::MarkFailed { name, error } => {
                if let Some(runner) = self.runners.get(&name) {
                    runner.mark_failed(&error);
                    if let Err(e) = self.db.save_state(&runner.state()).await {
                        warn!(workload = %name, error = %e, "state snapshot failed");
                    }
                }
            }
            Command::DeployedVersion { reply } => {
                let _ = reply.send(self.deployed_version.clone());
            }
            Command::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn start_workload(&mut self, name: &str) -> String {
        if !self.registry.contains(name) {
            return format!("Unknown workload: {}", name);
        }
        if self.runners.get(name).map(|r| r.is_running()).unwrap_or(false) {
            return format!("Workload '{}' is already running", name);
        }
        self.spawn_runner(name).await;
        format!("Started '{}'", name)
    }

    async fn stop_workload(&mut self, name: &str) -> String {
        match self.runners.get_mut(name) {
            Some(runner) if runner.is_running() => {
                runner.stop(STOP_TIMEOUT_SECS).await;
                format!("Stopped '{}'", name)
            }
            _ => format!("Workload '{}' is not running", name),
        }
    }

    fn get_status(&self, name: &str) -> Option<WorkloadState> {
        if let Some(runner) = self.runners.get(name) {
            return Some(runner.state());
        }
        self.registry.get(name).map(|spec| WorkloadState::new(spec.clone()))
    }

    fn list_workloads(&self) -> Vec<WorkloadState> {
        self.registry
            .list_all()
            .into_iter()
            .map(|spec| match self.runners.get(&spec.name) {
                Some(runner) => runner.state(),
                None => WorkloadState::new(spec),
            })
            .collect()
    }

    /// Create a runner for a registered spec. Schedule-mode workloads go
    /// to the scheduler instead of starting immediately.
    async fn spawn_runner(&mut self, name: &str) {
        let Some(spec) = self.registry.get(name).cloned() else {
            return;
        };
        let launch_override = self.plugins.launch_command_for(&spec);
        let mut runner = WorkloadRunner::new(
            spec.clone(),
            self.db.clone(),
            self.runner_ctx.clone(),
            launch_override,
        );
        if let Err(e) = self.db.save_state(&runner.state()).await {
            warn!(workload = %name, error = %e, "state snapshot failed");
        }

        if spec.run_mode == RunMode::Schedule {
            let expr = spec.schedule.as_deref().unwrap_or_default();
            match self.scheduler.add(name, expr) {
                Ok(()) => info!(workload = %name, cron = expr, "workload scheduled"),
                Err(e) => warn!(workload = %name, error = %e, "schedule registration failed"),
            }
        } else {
            runner.start();
        }
        self.runners.insert(name.to_string(), runner);
    }

    async fn tick_schedules(&mut self) {
        let now = Utc::now();
        for name in self.scheduler.due(now) {
            self.run_scheduled(&name).await;
            self.scheduler.advance(&name, now);
        }
    }

    /// Fire a scheduled workload once. A trigger that lands while the
    /// previous invocation still runs is skipped.
    async fn run_scheduled(&mut self, name: &str) {
        if self.runners.get(name).map(|r| r.is_running()).unwrap_or(false) {
            warn!(workload = %name, "skipping scheduled run, still running");
            return;
        }
        let Some(spec) = self.registry.get(name).cloned() else {
            return;
        };
        info!(workload = %name, "schedule triggered");
        let launch_override = self.plugins.launch_command_for(&spec);
        let mut runner = WorkloadRunner::new(
            spec,
            self.db.clone(),
            self.runner_ctx.clone(),
            launch_override,
        );
        runner.start();
        self.runners.insert(name.to_string(), runner);
    }

    /// Re-read all configs and reconcile with the running set. A parse or
    /// validation failure leaves the registry untouched.
    async fn reload_configs(&mut self) -> Result<ReloadSummary, String> {
        let known = self.plugins.known_workload_types();
        let new_specs = ConfigLoader::new(&self.config_dir)
            .load_all(Some(&known))
            .map_err(|e| e.to_string())?;
        self.validate_plugin_params(&new_specs)?;
        let new_by_name: HashMap<String, _> =
            new_specs.into_iter().map(|s| (s.name.clone(), s)).collect();

        let old_names: Vec<String> = self.registry.names();
        let mut summary = ReloadSummary::default();

        for name in &old_names {
            if !new_by_name.contains_key(name) {
                summary.removed.push(name.clone());
            }
        }
        for name in new_by_name.keys() {
            if !self.registry.contains(name) {
                summary.added.push(name.clone());
            }
        }

        for name in &summary.removed {
            self.stop_workload(name).await;
            self.runners.remove(name);
            self.scheduler.remove(name);
            let _ = self.registry.unregister(name);
            if let Err(e) = self.db.delete_state(name).await {
                warn!(workload = %name, error = %e, "state cleanup failed");
            }
            info!(workload = %name, "workload removed");
        }

        for name in &summary.added {
            if let Some(spec) = new_by_name.get(name) {
                let _ = self.registry.register(spec.clone());
                self.spawn_runner(name).await;
                info!(workload = %name, "workload added");
            }
        }

        for name in &old_names {
            let Some(new_spec) = new_by_name.get(name) else {
                continue;
            };
            let changed = self.registry.get(name) != Some(new_spec);
            if changed {
                self.stop_workload(name).await;
                self.runners.remove(name);
                self.scheduler.remove(name);
                let _ = self.registry.unregister(name);
                let _ = self.registry.register(new_spec.clone());
                self.spawn_runner(name).await;
                summary.restarted.push(name.clone());
                info!(workload = %name, "workload restarted (config changed)");
            } else {
                summary.unchanged.push(name.clone());
            }
        }

        self.deployed_version = read_deployed_version(&self.config_dir);

        summary.added.sort();
        summary.removed.sort();
        summary.restarted.sort();
        summary.unchanged.sort();
        info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            restarted = summary.restarted.len(),
            unchanged = summary.unchanged.len(),
            "configs reloaded"
        );
        Ok(summary)
    }

    /// Type-specific parameter validation, delegated to the workload-type
    /// plugin behind each spec.
    fn validate_plugin_params(&self, specs: &[crate::workload::WorkloadSpec]) -> Result<(), String> {
        for spec in specs {
            if let Some(plugin) = self.plugins.get_workload_type(&spec.workload_type) {
                plugin
                    .validate_config(&spec.params)
                    .map_err(|e| format!("workload '{}': {}", spec.name, e))?;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("orchestrator shutting down");
        for (name, runner) in self.runners.iter_mut() {
            if runner.is_running() {
                info!(workload = %name, "stopping workload for shutdown");
                runner.stop(STOP_TIMEOUT_SECS).await;
            }
        }
        info!("orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_workload(dir: &Path, file: &str, name: &str, extra: &str) {
        std::fs::write(
            dir.join(file),
            format!(
                "name: {}\ntype: script\nrun_mode: forever\nmodule: jobs.{}\nrestart_delay: 0.05\n{}",
                name, name, extra
            ),
        )
        .unwrap();
    }

    async fn booted(config_dir: &Path) -> (tokio::task::JoinHandle<()>, OrchestratorHandle) {
        let db = Database::open_in_memory().await.unwrap();
        let mut plugins = PluginRegistry::new();
        plugins.discover();
        // `sh -c` swallows the appended contract flags as positional args.
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
        (tokio::spawn(orch.run()), handle)
    }

    async fn wait_for_status(handle: &OrchestratorHandle, name: &str, status: &str) {
        for _ in 0..200 {
            if let Some(state) = handle.status(name).await {
                if state.status.as_str() == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("workload '{}' never reached status '{}'", name, status);
    }

    #[tokio::test]
    async fn boot_starts_configured_workloads() {
        let dir = TempDir::new().unwrap();
        write_workload(dir.path(), "a.yaml", "alpha", "");
        let (task, handle) = booted(dir.path()).await;

        wait_for_status(&handle, "alpha", "running").await;
        let list = handle.list_workloads().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].spec.name, "alpha");

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn command_messages_match_contract() {
        let dir = TempDir::new().unwrap();
        write_workload(dir.path(), "a.yaml", "alpha", "");
        let (task, handle) = booted(dir.path()).await;
        wait_for_status(&handle, "alpha", "running").await;

        assert_eq!(
            handle.start_workload("ghost").await,
            "Unknown workload: ghost"
        );
        assert_eq!(
            handle.start_workload("alpha").await,
            "Workload 'alpha' is already running"
        );
        assert_eq!(handle.stop_workload("alpha").await, "Stopped 'alpha'");
        assert_eq!(
            handle.stop_workload("alpha").await,
            "Workload 'alpha' is not running"
        );
        assert_eq!(handle.start_workload("alpha").await, "Started 'alpha'");

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reload_diff_applies_adds_removes_unchanged() {
        let dir = TempDir::new().unwrap();
        write_workload(dir.path(), "a.yaml", "alpha", "");
        write_workload(dir.path(), "b.yaml", "beta", "");
        let (task, handle) = booted(dir.path()).await;
        wait_for_status(&handle, "alpha", "running").await;
        wait_for_status(&handle, "beta", "running").await;

        std::fs::remove_file(dir.path().join("a.yaml")).unwrap();
        write_workload(dir.path(), "c.yaml", "gamma", "");

        let summary = handle.reload_configs().await.unwrap();
        assert_eq!(summary.added, vec!["gamma"]);
        assert_eq!(summary.removed, vec!["alpha"]);
        assert!(summary.restarted.is_empty());
        assert_eq!(summary.unchanged, vec!["beta"]);

        wait_for_status(&handle, "gamma", "running").await;
        assert!(handle.status("alpha").await.is_none());

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reload_restarts_changed_specs() {
        let dir = TempDir::new().unwrap();
        write_workload(dir.path(), "a.yaml", "alpha", "");
        let (task, handle) = booted(dir.path()).await;
        wait_for_status(&handle, "alpha", "running").await;

        write_workload(dir.path(), "a.yaml", "alpha", "tags: [canary]\n");
        let summary = handle.reload_configs().await.unwrap();
        assert_eq!(summary.restarted, vec!["alpha"]);
        assert!(summary.unchanged.is_empty());
        wait_for_status(&handle, "alpha", "running").await;
        let state = handle.status("alpha").await.unwrap();
        assert_eq!(state.spec.tags, vec!["canary"]);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reload_is_idempotent_without_changes() {
        let dir = TempDir::new().unwrap();
        write_workload(dir.path(), "a.yaml", "alpha", "");
        let (task, handle) = booted(dir.path()).await;
        wait_for_status(&handle, "alpha", "running").await;

        let summary = handle.reload_configs().await.unwrap();
        assert!(summary.added.is_empty());
        assert!(summary.removed.is_empty());
        assert!(summary.restarted.is_empty());
        assert_eq!(summary.unchanged, vec!["alpha"]);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn broken_config_fails_reload_and_keeps_registry() {
        let dir = TempDir::new().unwrap();
        write_workload(dir.path(), "a.yaml", "alpha", "");
        let (task, handle) = booted(dir.path()).await;
        wait_for_status(&handle, "alpha", "running").await;

        std::fs::write(dir.path().join("bad.yaml"), "name: [nope\n").unwrap();
        let err = handle.reload_configs().await.unwrap_err();
        assert!(err.contains("bad.yaml"));

        // Registry unchanged: alpha still listed and running.
        let list = handle.list_workloads().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status.as_str(), "running");

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn schedule_mode_registers_without_starting() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("cron.yaml"),
            "name: nightly\ntype: script\nrun_mode: schedule\nmodule: jobs.nightly\nschedule: '0 3 * * *'\n",
        )
        .unwrap();
        let (task, handle) = booted(dir.path()).await;

        let state = handle.status("nightly").await.unwrap();
        assert_eq!(state.status.as_str(), "registered");
        assert_eq!(state.run_count, 0);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn deployed_version_follows_marker_file() {
        let root = TempDir::new().unwrap();
        let config_dir = root.path().join("configs");
        std::fs::create_dir(&config_dir).unwrap();
        write_workload(&config_dir, "a.yaml", "alpha", "");
        std::fs::write(root.path().join(".mctl-version"), "v7\n").unwrap();

        let (task, handle) = booted(&config_dir).await;
        assert_eq!(handle.deployed_version().await.as_deref(), Some("v7"));

        std::fs::write(root.path().join(".mctl-version"), "v8\n").unwrap();
        handle.reload_configs().await.unwrap();
        assert_eq!(handle.deployed_version().await.as_deref(), Some("v8"));

        handle.shutdown().await;
        task.await.unwrap();
    }
}
