//! # Health Checker — Liveness Sweep Over Supervised Children
//!
//! Every interval (default 10 s) the checker snapshots all workload states
//! and sends a null signal to each running child. A vanished process marks
//! the workload failed through the orchestrator mailbox; the runner's own
//! wait() normally notices exits first, so this catches the cases it
//! cannot, such as a child reaped or killed behind the supervisor's back.
//!
//! Workloads with a memory limit also get an RSS comparison: crossing 90%
//! of the limit logs a warning but changes no state. Enforcement itself is
//! the address-space rlimit installed at launch.

use std::time::Duration;

use sysinfo::System;
use tracing::{info, warn};

use crate::metrics::process_rss_mb;
use crate::orchestrator::OrchestratorHandle;
use crate::workload::{WorkloadState, WorkloadStatus};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Fraction of `memory_limit_mb` that triggers the RSS warning.
const RSS_WARN_RATIO: f64 = 0.9;

pub struct HealthChecker {
    handle: OrchestratorHandle,
    interval: Duration,
    sys: System,
}

impl HealthChecker {
    pub fn new(handle: OrchestratorHandle, interval: Duration) -> Self {
        HealthChecker {
            handle,
            interval,
            sys: System::new(),
        }
    }

    /// Periodic sweep; runs until the task is cancelled at shutdown.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs_f64(), "health checker started");
        loop {
            self.check_all().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn check_all(&mut self) {
        let states = self.handle.list_workloads().await;
        for (name, error) in dead_verdicts(&states) {
            warn!(workload = %name, error = %error, "health check failed: process not found");
            self.handle.mark_failed(&name, &error).await;
        }
        for state in &states {
            self.check_memory(state);
        }
    }

    fn check_memory(&mut self, state: &WorkloadState) {
        let (Some(limit), Some(pid)) = (state.spec.memory_limit_mb, state.pid) else {
            return;
        };
        if state.status != WorkloadStatus::Running {
            return;
        }
        // Missing RSS source (platform or already-gone process) is non-fatal.
        let Some(rss_mb) = process_rss_mb(&mut self.sys, pid) else {
            return;
        };
        if rss_mb >= limit as f64 * RSS_WARN_RATIO {
            warn!(
                workload = %state.spec.name,
                rss_mb = (rss_mb * 10.0).round() / 10.0,
                limit_mb = limit,
                "workload approaching memory limit"
            );
        }
    }
}

/// Workloads whose recorded child no longer exists.
fn dead_verdicts(states: &[WorkloadState]) -> Vec<(String, String)> {
    states
        .iter()
        .filter(|s| s.status == WorkloadStatus::Running)
        .filter_map(|s| {
            let pid = s.pid?;
            if is_process_alive(pid) {
                None
            } else {
                Some((s.spec.name.clone(), format!("Process {} not found", pid)))
            }
        })
        .collect()
}

/// Null-signal probe. EPERM means the process exists but is not ours.
#[cfg(unix)]
pub(crate) fn is_process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::spec_fixture;

    fn running_state(name: &str, pid: Option<u32>) -> WorkloadState {
        let mut state = WorkloadState::new(spec_fixture(name));
        state.status = WorkloadStatus::Running;
        state.pid = pid;
        state
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_dead() {
        assert!(!is_process_alive(0x7fff_fff0));
    }

    #[test]
    fn dead_process_yields_verdict() {
        let states = vec![running_state("svc", Some(0x7fff_fff0))];
        let verdicts = dead_verdicts(&states);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].0, "svc");
        assert_eq!(verdicts[0].1, format!("Process {} not found", 0x7fff_fff0));
    }

    #[test]
    fn live_process_yields_no_verdict() {
        let states = vec![running_state("svc", Some(std::process::id()))];
        assert!(dead_verdicts(&states).is_empty());
    }

    #[test]
    fn non_running_states_are_ignored() {
        let mut stopped = running_state("svc", Some(0x7fff_fff0));
        stopped.status = WorkloadStatus::Stopped;
        let pidless = running_state("other", None);
        assert!(dead_verdicts(&[stopped, pidless]).is_empty());
    }
}
