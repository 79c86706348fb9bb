//! `daemon.yaml` — fleet and central process settings.
//!
//! The file is optional; every field has a default so a bare node can run
//! with nothing but a config directory of workload definitions.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigError;

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9100
}

fn default_heartbeat_interval() -> f64 {
    30.0
}

fn default_central_host() -> String {
    "0.0.0.0".to_string()
}

fn default_central_port() -> u16 {
    8080
}

fn default_stale_threshold() -> f64 {
    90.0
}

/// Node-side fleet participation: HTTP API plus heartbeat reporting.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub enabled: bool,
    pub client_name: Option<String>,
    pub api_host: String,
    pub api_port: u16,
    pub central_api_url: Option<String>,
    pub heartbeat_interval_seconds: f64,
    pub api_token: Option<String>,
    pub mdns_enabled: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            enabled: false,
            client_name: None,
            api_host: default_api_host(),
            api_port: default_api_port(),
            central_api_url: None,
            heartbeat_interval_seconds: default_heartbeat_interval(),
            api_token: None,
            mdns_enabled: false,
        }
    }
}

/// Controller-side settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub db_path: Option<PathBuf>,
    pub inventory_path: Option<PathBuf>,
    pub api_token: Option<String>,
    pub stale_threshold_seconds: f64,
    pub deploy_script_path: Option<PathBuf>,
    pub mdns_enabled: bool,
}

impl Default for CentralConfig {
    fn default() -> Self {
        CentralConfig {
            enabled: false,
            host: default_central_host(),
            port: default_central_port(),
            db_path: None,
            inventory_path: None,
            api_token: None,
            stale_threshold_seconds: default_stale_threshold(),
            deploy_script_path: None,
            mdns_enabled: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub fleet: FleetConfig,
    pub central: CentralConfig,
    /// Leading words of the worker launch command. Defaults to the current
    /// executable plus its hidden `worker` subcommand; plugin workload
    /// types and tests override it.
    pub worker_command: Option<Vec<String>>,
}

impl DaemonConfig {
    /// Load `daemon.yaml` / `daemon.yml` from the config directory; absent
    /// files yield all defaults.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        for name in ["daemon.yaml", "daemon.yml"] {
            let path = config_dir.join(name);
            if path.exists() {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::new(&path, format!("read failed: {}", e)))?;
                return serde_yaml::from_str(&text)
                    .map_err(|e| ConfigError::new(&path, format!("invalid daemon config: {}", e)));
            }
        }
        Ok(DaemonConfig::default())
    }
}
