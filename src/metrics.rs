//! # Metrics — Node Resource Telemetry
//!
//! Collects the system metrics attached to every heartbeat payload and
//! cached on the controller's client rows, using the [`sysinfo`] crate.
//!
//! | Metric | Source | Unit |
//! |--------|--------|------|
//! | CPU usage | `System::global_cpu_usage()` | percent (0–100) |
//! | Memory used/total | `System::used_memory()` / `total_memory()` | MiB |
//! | Disk used/total | `Disks::new_with_refreshed_list()` | GiB |
//!
//! The `sysinfo::System` instance is reused across heartbeat intervals
//! (passed by `&mut`) to amortize initialization cost; CPU percentages need
//! two refreshes before they are meaningful.

use serde::{Deserialize, Serialize};
use sysinfo::System;

const MIB: f64 = 1_048_576.0;
const GIB: f64 = 1_073_741_824.0;

/// System-level resource metrics reported by a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
}

pub fn collect(sys: &mut System) -> SystemMetrics {
    sys.refresh_cpu_all();
    sys.refresh_memory();

    let cpu = sys.global_cpu_usage() as f64;
    let mem_total = sys.total_memory() as f64;
    let mem_used = sys.used_memory() as f64;

    let mut disk_total: u64 = 0;
    let mut disk_used: u64 = 0;
    for disk in sysinfo::Disks::new_with_refreshed_list().iter() {
        disk_total += disk.total_space();
        disk_used += disk.total_space() - disk.available_space();
    }

    SystemMetrics {
        cpu_percent: (cpu * 10.0).round() / 10.0,
        memory_used_mb: (mem_used / MIB * 10.0).round() / 10.0,
        memory_total_mb: (mem_total / MIB * 10.0).round() / 10.0,
        disk_used_gb: (disk_used as f64 / GIB * 100.0).round() / 100.0,
        disk_total_gb: (disk_total as f64 / GIB * 100.0).round() / 100.0,
    }
}

/// Resident set size of a process in MiB, when the platform exposes it.
pub fn process_rss_mb(sys: &mut System, pid: u32) -> Option<f64> {
    let pid = sysinfo::Pid::from_u32(pid);
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory() as f64 / MIB)
}
