//! # Plugins — Workload Type, Health Check, and Log Processor Extensions
//!
//! Extension seams for the supervisor. First-party plugins are registered
//! from a static constructor table at startup (compile-time registration);
//! external extensions go through the same `register_*` methods. A
//! constructor that fails is logged and skipped — one bad plugin must not
//! take the daemon down.
//!
//! ## Contracts
//!
//! - **WorkloadType**: validates type-specific params and may override the
//!   launch argv. Returning an empty argv means "use the default worker
//!   launcher". The built-in names `agent`, `script`, `service` are
//!   reserved.
//! - **HealthCheck**: async probe over a state snapshot.
//! - **LogProcessor**: async per-line transform; returning `None` drops the
//!   line.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::workload::{WorkloadSpec, WorkloadState};

pub const BUILTIN_WORKLOAD_TYPES: &[&str] = &["agent", "script", "service"];

pub trait WorkloadTypePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Validate type-specific params. Returns a message on rejection.
    fn validate_config(&self, params: &Map<String, Value>) -> Result<(), String>;

    /// Launch argv override. Empty means the default worker launcher.
    fn build_launch_command(&self, spec: &WorkloadSpec) -> Vec<String>;
}

pub struct HealthReport {
    pub healthy: bool,
    pub details: Value,
}

#[async_trait]
pub trait HealthCheckPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, state: &WorkloadState) -> HealthReport;
}

#[async_trait]
pub trait LogProcessorPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Transform a log line; `None` drops it.
    async fn process(&self, workload_name: &str, line: &str) -> Option<String>;
}

// ── Built-in workload types ─────────────────────────────────────

/// Shared behavior for the three built-ins: no extra param constraints,
/// default launcher.
macro_rules! builtin_type {
    ($ty:ident, $name:literal) => {
        struct $ty;

        impl WorkloadTypePlugin for $ty {
            fn name(&self) -> &str {
                $name
            }

            fn validate_config(&self, _params: &Map<String, Value>) -> Result<(), String> {
                Ok(())
            }

            fn build_launch_command(&self, _spec: &WorkloadSpec) -> Vec<String> {
                Vec::new()
            }
        }
    };
}

builtin_type!(AgentType, "agent");
builtin_type!(ScriptType, "script");
builtin_type!(ServiceType, "service");

type WorkloadTypeCtor = fn() -> Result<Box<dyn WorkloadTypePlugin>, String>;

/// Static registration table, populated at compile time. External crates
/// linking mctl as a library register at runtime via
/// [`PluginRegistry::register_workload_type`] instead.
const WORKLOAD_TYPE_CTORS: &[WorkloadTypeCtor] = &[
    || Ok(Box::new(AgentType)),
    || Ok(Box::new(ScriptType)),
    || Ok(Box::new(ServiceType)),
];

// ── Registry ────────────────────────────────────────────────────

#[derive(Default)]
pub struct PluginRegistry {
    workload_types: HashMap<String, Box<dyn WorkloadTypePlugin>>,
    health_checks: HashMap<String, Box<dyn HealthCheckPlugin>>,
    log_processors: HashMap<String, Box<dyn LogProcessorPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    /// Instantiate everything in the static tables. Called once at boot.
    pub fn discover(&mut self) {
        for ctor in WORKLOAD_TYPE_CTORS {
            match ctor() {
                Ok(plugin) => {
                    info!(kind = "workload_type", name = plugin.name(), "plugin loaded");
                    self.workload_types.insert(plugin.name().to_string(), plugin);
                }
                Err(e) => error!(kind = "workload_type", error = %e, "failed to load plugin"),
            }
        }
    }

    pub fn register_workload_type(&mut self, plugin: Box<dyn WorkloadTypePlugin>) {
        self.workload_types.insert(plugin.name().to_string(), plugin);
    }

    pub fn register_health_check(&mut self, plugin: Box<dyn HealthCheckPlugin>) {
        self.health_checks.insert(plugin.name().to_string(), plugin);
    }

    pub fn register_log_processor(&mut self, plugin: Box<dyn LogProcessorPlugin>) {
        self.log_processors.insert(plugin.name().to_string(), plugin);
    }

    pub fn get_workload_type(&self, name: &str) -> Option<&dyn WorkloadTypePlugin> {
        self.workload_types.get(name).map(|p| p.as_ref())
    }

    pub fn get_health_check(&self, name: &str) -> Option<&dyn HealthCheckPlugin> {
        self.health_checks.get(name).map(|p| p.as_ref())
    }

    pub fn get_log_processor(&self, name: &str) -> Option<&dyn LogProcessorPlugin> {
        self.log_processors.get(name).map(|p| p.as_ref())
    }

    /// All valid workload type names: built-ins plus registered plugins.
    pub fn known_workload_types(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> =
            BUILTIN_WORKLOAD_TYPES.iter().map(|s| s.to_string()).collect();
        names.extend(self.workload_types.keys().cloned());
        names
    }

    /// Launch argv for a spec, if a plugin overrides the default launcher.
    pub fn launch_command_for(&self, spec: &WorkloadSpec) -> Option<Vec<String>> {
        let plugin = self.workload_types.get(&spec.workload_type)?;
        let argv = plugin.build_launch_command(spec);
        if argv.is_empty() {
            None
        } else {
            Some(argv)
        }
    }
}
