//! Run-mode strategy — the restart/completion policy behind each runner.
//!
//! Exit codes do not influence the decision: a forever workload restarts
//! after a crash and after a clean exit alike, and an n-times workload
//! counts failed runs toward its quota.

use crate::workload::{RunMode, WorkloadSpec};

/// Per-mode policy answering two questions after every child exit:
/// restart? finished?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunModeStrategy {
    /// Always restart until explicitly stopped.
    Forever,
    /// Restart until `run_count` reaches `max_runs`.
    NTimes { max_runs: u32 },
    /// One shot per cron trigger; the scheduler starts the next run.
    Schedule,
}

impl RunModeStrategy {
    /// Build the strategy for a spec. `max_runs` is validated at config
    /// load time; a missing value here falls back to a single run.
    pub fn for_spec(spec: &WorkloadSpec) -> Self {
        match spec.run_mode {
            RunMode::Forever => RunModeStrategy::Forever,
            RunMode::NTimes => RunModeStrategy::NTimes {
                max_runs: spec.max_runs.unwrap_or(1),
            },
            RunMode::Schedule => RunModeStrategy::Schedule,
        }
    }

    pub fn should_restart(&self, run_count: u32, _exit_code: i32) -> bool {
        match self {
            RunModeStrategy::Forever => true,
            RunModeStrategy::NTimes { max_runs } => run_count < *max_runs,
            RunModeStrategy::Schedule => false,
        }
    }

    pub fn is_complete(&self, run_count: u32) -> bool {
        match self {
            RunModeStrategy::Forever => false,
            RunModeStrategy::NTimes { max_runs } => run_count >= *max_runs,
            RunModeStrategy::Schedule => true,
        }
    }
}
