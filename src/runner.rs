//! # Workload Runner — One Child Process, Supervised
//!
//! Each runner owns a single supervision task that launches the workload's
//! child process, waits for it (bounded by `timeout_seconds` when set),
//! records the run, and then asks the run-mode strategy whether to restart
//! or finish.
//!
//! ```text
//! start() ──► supervise task:  launch ─► wait ─► record ─► strategy ─┐
//!                         ▲                                          │
//!                         └───────── sleep(restart_delay) ◄──────────┘
//! stop(t) ──► SIGTERM ─► wait ≤ t ─► SIGKILL ─► task exits ─► stopped
//! ```
//!
//! Resource limits are applied inside the child between fork and exec:
//! an address-space cap via `setrlimit(RLIMIT_AS)` and a niceness bump.
//! On platforms without fork semantics the limits are skipped with a log
//! line and never leak into the public API.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::Database;
use crate::modes::RunModeStrategy;
use crate::workload::{WorkloadSpec, WorkloadState, WorkloadStatus};

/// Bytes of stderr kept as `last_error` / run-record error tail.
const STDERR_TAIL_BYTES: usize = 500;

/// Lock a mutex, recovering from poisoning.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Node-level settings shared by every runner.
#[derive(Clone)]
pub struct RunnerContext {
    /// Leading words of the default worker launch command; the contract
    /// flags are appended after them.
    pub worker_command: Vec<String>,
    pub log_dir: Option<PathBuf>,
}

impl RunnerContext {
    /// Default launcher: this executable's hidden `worker` subcommand.
    pub fn from_current_exe(log_dir: Option<PathBuf>) -> Self {
        let exe = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "mctl".to_string());
        RunnerContext {
            worker_command: vec![exe, "worker".to_string()],
            log_dir,
        }
    }
}

pub struct WorkloadRunner {
    spec: WorkloadSpec,
    strategy: RunModeStrategy,
    state: Arc<Mutex<WorkloadState>>,
    db: Database,
    ctx: RunnerContext,
    /// Plugin-provided argv override; `None` uses the default launcher.
    launch_override: Option<Vec<String>>,
    stop_tx: watch::Sender<Option<f64>>,
    supervise: Option<JoinHandle<()>>,
}

impl WorkloadRunner {
    pub fn new(
        spec: WorkloadSpec,
        db: Database,
        ctx: RunnerContext,
        launch_override: Option<Vec<String>>,
    ) -> Self {
        let strategy = RunModeStrategy::for_spec(&spec);
        let state = Arc::new(Mutex::new(WorkloadState::new(spec.clone())));
        let (stop_tx, _) = watch::channel(None);
        WorkloadRunner {
            spec,
            strategy,
            state,
            db,
            ctx,
            launch_override,
            stop_tx,
            supervise: None,
        }
    }

    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    /// Snapshot of the current runtime state.
    pub fn state(&self) -> WorkloadState {
        lock_or_recover(&self.state).clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            lock_or_recover(&self.state).status,
            WorkloadStatus::Starting | WorkloadStatus::Running
        )
    }

    /// Flag the workload as failed from outside the supervision loop (the
    /// health checker's dead-process verdict).
    pub fn mark_failed(&self, error: impl Into<String>) {
        let mut state = lock_or_recover(&self.state);
        state.status = WorkloadStatus::Failed;
        state.last_error = Some(error.into());
        state.pid = None;
    }

    /// Launch the supervision task. No-op (with a warning) when already
    /// running.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!(workload = %self.spec.name, "workload already running");
            return;
        }
        let _ = self.stop_tx.send(None);
        lock_or_recover(&self.state).status = WorkloadStatus::Starting;

        let loop_ctx = SuperviseLoop {
            spec: self.spec.clone(),
            strategy: self.strategy,
            state: Arc::clone(&self.state),
            db: self.db.clone(),
            ctx: self.ctx.clone(),
            launch_override: self.launch_override.clone(),
            stop_rx: self.stop_tx.subscribe(),
        };
        self.supervise = Some(tokio::spawn(loop_ctx.run()));
    }

    /// Request graceful termination: SIGTERM, wait up to `timeout` seconds,
    /// escalate to SIGKILL, then reap the supervision task. Idempotent.
    pub async fn stop(&mut self, timeout: f64) {
        {
            let mut state = lock_or_recover(&self.state);
            if matches!(
                state.status,
                WorkloadStatus::Starting | WorkloadStatus::Running
            ) {
                state.status = WorkloadStatus::Stopping;
            }
        }
        let _ = self.stop_tx.send(Some(timeout));

        if let Some(handle) = self.supervise.take() {
            let abort = handle.abort_handle();
            let bound = Duration::from_secs_f64(timeout.max(0.0)) + Duration::from_secs(5);
            if tokio::time::timeout(bound, handle).await.is_err() {
                warn!(workload = %self.spec.name, "supervision task did not exit in time");
                abort.abort();
            }
        }

        {
            let mut state = lock_or_recover(&self.state);
            state.status = WorkloadStatus::Stopped;
            state.last_stopped = Some(Utc::now());
            state.pid = None;
        }
        if let Err(e) = self.db.save_state(&self.state()).await {
            warn!(workload = %self.spec.name, error = %e, "state snapshot failed");
        }
        info!(workload = %self.spec.name, "workload stopped");
    }
}

impl Drop for WorkloadRunner {
    fn drop(&mut self) {
        if let Some(handle) = self.supervise.take() {
            handle.abort();
        }
    }
}

enum WaitOutcome {
    Exited(Option<std::process::ExitStatus>),
    TimedOut,
    StopRequested,
}

struct SuperviseLoop {
    spec: WorkloadSpec,
    strategy: RunModeStrategy,
    state: Arc<Mutex<WorkloadState>>,
    db: Database,
    ctx: RunnerContext,
    launch_override: Option<Vec<String>>,
    stop_rx: watch::Receiver<Option<f64>>,
}

impl SuperviseLoop {
    async fn run(mut self) {
        loop {
            if self.stop_requested() {
                break;
            }

            let mut child = match self.launch() {
                Ok(child) => child,
                Err(e) => {
                    error!(workload = %self.spec.name, error = %e, "failed to launch workload");
                    let mut state = lock_or_recover(&self.state);
                    state.status = WorkloadStatus::Failed;
                    state.last_error = Some(e);
                    break;
                }
            };
            let pid = child.id();

            let stderr_handle = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let _ = stderr.read_to_end(&mut buf).await;
                    buf
                })
            });

            let run_count = {
                let mut state = lock_or_recover(&self.state);
                state.status = WorkloadStatus::Running;
                state.pid = pid;
                state.run_count += 1;
                state.last_started = Some(Utc::now());
                state.run_count
            };
            info!(workload = %self.spec.name, pid, run_count, "workload started");
            self.snapshot().await;

            let run_id = match self.db.record_start(&self.spec.name).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(workload = %self.spec.name, error = %e, "run record failed");
                    None
                }
            };

            let outcome = self.wait_for_exit(&mut child).await;
            let status = match &outcome {
                WaitOutcome::Exited(s) => *s,
                // Killed by us; reap for the real (signal) status.
                WaitOutcome::TimedOut | WaitOutcome::StopRequested => child.wait().await.ok(),
            };
            let exit_code = status.map(exit_code_of).unwrap_or(-1);

            let stderr_tail = match stderr_handle {
                Some(handle) => tail_of(&handle.await.unwrap_or_default()),
                None => None,
            };
            let error_msg = if exit_code != 0 { stderr_tail } else { None };

            {
                let mut state = lock_or_recover(&self.state);
                state.pid = None;
                if let Some(err) = &error_msg {
                    state.last_error = Some(err.clone());
                }
            }
            if exit_code != 0 {
                warn!(workload = %self.spec.name, exit_code, error = error_msg.as_deref().unwrap_or(""), "workload exited with error");
            } else {
                info!(workload = %self.spec.name, exit_code, "workload exited cleanly");
            }

            if let Some(run_id) = run_id {
                if let Err(e) = self
                    .db
                    .record_finish(run_id, exit_code as i64, error_msg.as_deref())
                    .await
                {
                    warn!(workload = %self.spec.name, error = %e, "run record finish failed");
                }
            }

            if matches!(outcome, WaitOutcome::StopRequested) || self.stop_requested() {
                break;
            }

            if self.strategy.is_complete(run_count) {
                lock_or_recover(&self.state).status = WorkloadStatus::Completed;
                info!(workload = %self.spec.name, run_count, "workload completed all runs");
                break;
            }

            if self.strategy.should_restart(run_count, exit_code) {
                info!(
                    workload = %self.spec.name,
                    delay = self.spec.restart_delay_seconds,
                    "restarting workload"
                );
                if self.cancellable_sleep(self.spec.restart_delay_seconds).await {
                    break;
                }
            } else {
                break;
            }
        }
        self.snapshot().await;
    }

    fn stop_requested(&self) -> bool {
        self.stop_rx.borrow().is_some()
    }

    async fn snapshot(&self) {
        let state = lock_or_recover(&self.state).clone();
        if let Err(e) = self.db.save_state(&state).await {
            warn!(workload = %self.spec.name, error = %e, "state snapshot failed");
        }
    }

    fn argv(&self) -> Vec<String> {
        if let Some(argv) = &self.launch_override {
            return argv.clone();
        }
        let mut argv = self.ctx.worker_command.clone();
        argv.extend([
            "--module".to_string(),
            self.spec.module_path.clone(),
            "--entry-point".to_string(),
            self.spec.entry_point.clone(),
            "--params-json".to_string(),
            self.spec.params_json(),
            "--workload-name".to_string(),
            self.spec.name.clone(),
        ]);
        if let Some(dir) = &self.ctx.log_dir {
            argv.push("--log-file".to_string());
            argv.push(
                dir.join(format!("{}.log", self.spec.name))
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        argv
    }

    fn launch(&self) -> Result<Child, String> {
        let argv = self.argv();
        if argv.is_empty() {
            return Err("empty launch command".to_string());
        }
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        self.install_limits(&mut cmd);
        cmd.spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", argv[0], e))
    }

    #[cfg(unix)]
    fn install_limits(&self, cmd: &mut Command) {
        let memory_limit_mb = self.spec.memory_limit_mb;
        let cpu_nice = self.spec.cpu_nice;
        if memory_limit_mb.is_none() && cpu_nice.is_none() {
            return;
        }
        info!(
            workload = %self.spec.name,
            memory_limit_mb, cpu_nice,
            "applying resource limits"
        );
        unsafe {
            cmd.pre_exec(move || {
                if let Some(mb) = memory_limit_mb {
                    let bytes = (mb as libc::rlim_t).saturating_mul(1024 * 1024);
                    let limit = libc::rlimit {
                        rlim_cur: bytes,
                        rlim_max: bytes,
                    };
                    libc::setrlimit(libc::RLIMIT_AS, &limit);
                }
                if let Some(nice) = cpu_nice {
                    libc::nice(nice);
                }
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn install_limits(&self, _cmd: &mut Command) {
        if self.spec.memory_limit_mb.is_some() || self.spec.cpu_nice.is_some() {
            warn!(workload = %self.spec.name, "resource limits unsupported on this platform");
        }
    }

    /// Wait for the child, bounded by the per-invocation timeout and
    /// interruptible by a stop request. The kill/terminate side effects
    /// happen after the race resolves so the select arms stay borrow-free.
    async fn wait_for_exit(&mut self, child: &mut Child) -> WaitOutcome {
        let invocation_timeout = self.spec.timeout_seconds;
        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status.ok()),
            _ = maybe_sleep(invocation_timeout) => WaitOutcome::TimedOut,
            _ = self.stop_rx.changed() => WaitOutcome::StopRequested,
        };
        match &outcome {
            WaitOutcome::TimedOut => {
                warn!(workload = %self.spec.name, timeout = invocation_timeout, "workload timed out");
                let _ = child.start_kill();
            }
            WaitOutcome::StopRequested => {
                let timeout = (*self.stop_rx.borrow()).unwrap_or(10.0);
                terminate_gracefully(child, timeout, &self.spec.name).await;
            }
            WaitOutcome::Exited(_) => {}
        }
        outcome
    }

    /// Sleep that a stop request cuts short. Returns true when stopped.
    async fn cancellable_sleep(&mut self, seconds: f64) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))) => false,
            _ = self.stop_rx.changed() => true,
        }
    }
}

/// SIGTERM, bounded wait, SIGKILL escalation.
async fn terminate_gracefully(child: &mut Child, timeout: f64, name: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    let bound = Duration::from_secs_f64(timeout.max(0.0));
    if tokio::time::timeout(bound, child.wait()).await.is_err() {
        warn!(workload = %name, "workload did not stop gracefully, killing");
        let _ = child.start_kill();
    }
}

/// Pending future when no timeout is configured, so `select!` never takes
/// that branch.
async fn maybe_sleep(seconds: Option<f64>) {
    match seconds {
        Some(s) => tokio::time::sleep(Duration::from_secs_f64(s.max(0.0))).await,
        None => std::future::pending().await,
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

fn tail_of(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
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
    use crate::workload::{spec_fixture, RunMode};
    use std::path::Path;

    fn write_script(dir: &Path, name: &str, body: &str) -> Vec<String> {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        vec![path.to_string_lossy().into_owned()]
    }

    fn runner_for(
        spec: crate::workload::WorkloadSpec,
        db: Database,
        worker_command: Vec<String>,
    ) -> WorkloadRunner {
        let ctx = RunnerContext {
            worker_command,
            log_dir: None,
        };
        WorkloadRunner::new(spec, db, ctx, None)
    }

    async fn wait_until<F: Fn(&WorkloadState) -> bool>(
        runner: &WorkloadRunner,
        cond: F,
        max: Duration,
    ) -> WorkloadState {
        let deadline = tokio::time::Instant::now() + max;
        loop {
            let state = runner.state();
            if cond(&state) {
                return state;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached; state: {:?}",
                state
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn n_times_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = write_script(dir.path(), "ok.sh", "exit 0");
        let db = Database::open_in_memory().await.unwrap();

        let mut spec = spec_fixture("counter");
        spec.run_mode = RunMode::NTimes;
        spec.max_runs = Some(3);
        spec.restart_delay_seconds = 0.0;

        let mut runner = runner_for(spec, db.clone(), cmd);
        runner.start();
        let state = wait_until(
            &runner,
            |s| s.status == WorkloadStatus::Completed,
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(state.run_count, 3);
        assert!(state.pid.is_none());

        let history = db.run_history("counter", 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|r| r.exit_code == Some(0)));
        assert!(history.iter().all(|r| r.finished_at.is_some()));
    }

    #[tokio::test]
    async fn forever_restarts_and_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = write_script(dir.path(), "fail.sh", "echo boom >&2; exit 1");
        let db = Database::open_in_memory().await.unwrap();

        let mut spec = spec_fixture("svc");
        spec.restart_delay_seconds = 0.05;

        let mut runner = runner_for(spec, db.clone(), cmd);
        runner.start();
        let state = wait_until(&runner, |s| s.run_count >= 2, Duration::from_secs(10)).await;
        assert!(state.last_error.as_deref().unwrap_or("").contains("boom"));
        runner.stop(2.0).await;
        assert_eq!(runner.state().status, WorkloadStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_terminates_long_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = write_script(dir.path(), "slow.sh", "sleep 30");
        let db = Database::open_in_memory().await.unwrap();

        let mut runner = runner_for(spec_fixture("svc"), db, cmd);
        runner.start();
        wait_until(
            &runner,
            |s| s.status == WorkloadStatus::Running,
            Duration::from_secs(10),
        )
        .await;

        let started = tokio::time::Instant::now();
        runner.stop(2.0).await;
        assert!(started.elapsed() < Duration::from_secs(8));
        let state = runner.state();
        assert_eq!(state.status, WorkloadStatus::Stopped);
        assert!(state.pid.is_none());
        assert!(state.last_stopped.is_some());
    }

    #[tokio::test]
    async fn invocation_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = write_script(dir.path(), "hang.sh", "sleep 30");
        let db = Database::open_in_memory().await.unwrap();

        let mut spec = spec_fixture("batch");
        spec.run_mode = RunMode::NTimes;
        spec.max_runs = Some(1);
        spec.timeout_seconds = Some(0.2);
        spec.restart_delay_seconds = 0.0;

        let mut runner = runner_for(spec, db.clone(), cmd);
        runner.start();
        wait_until(
            &runner,
            |s| s.status == WorkloadStatus::Completed,
            Duration::from_secs(10),
        )
        .await;

        let history = db.run_history("batch", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_ne!(history[0].exit_code, Some(0), "timed-out run must not report success");
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = write_script(dir.path(), "slow.sh", "sleep 30");
        let db = Database::open_in_memory().await.unwrap();

        let mut runner = runner_for(spec_fixture("svc"), db, cmd);
        runner.start();
        wait_until(
            &runner,
            |s| s.status == WorkloadStatus::Running,
            Duration::from_secs(10),
        )
        .await;
        runner.start();
        assert_eq!(runner.state().run_count, 1);
        runner.stop(2.0).await;
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed() {
        let db = Database::open_in_memory().await.unwrap();
        let mut runner = runner_for(
            spec_fixture("ghost"),
            db,
            vec!["/definitely/not/a/binary".to_string()],
        );
        runner.start();
        let state = wait_until(
            &runner,
            |s| s.status == WorkloadStatus::Failed,
            Duration::from_secs(5),
        )
        .await;
        assert!(state.last_error.as_deref().unwrap_or("").contains("spawn"));
    }
}
