//! Administrator-maintained inventory of fleet clients.
//!
//! Field resolution is client-first: a field set on the client entry wins,
//! otherwise the `defaults` mapping supplies it. Only `host` is mandatory;
//! `name` falls back to the host.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::config::ConfigError;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct InventoryDefaults {
    pub api_port: Option<u16>,
    pub env: BTreeMap<String, String>,
    pub workloads: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InventoryClient {
    pub host: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_port: Option<u16>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub workloads: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub defaults: InventoryDefaults,
    pub clients: Vec<InventoryClient>,
}

/// A client entry with defaults applied.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedClient {
    pub name: String,
    pub host: String,
    pub api_port: u16,
    pub env: BTreeMap<String, String>,
    pub workloads: Vec<String>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(path, format!("read failed: {}", e)))?;
        serde_yaml::from_str(&text)
            .map_err(|e| ConfigError::new(path, format!("invalid inventory: {}", e)))
    }

    pub fn resolve(&self) -> Vec<ResolvedClient> {
        self.clients
            .iter()
            .map(|c| ResolvedClient {
                name: c.name.clone().unwrap_or_else(|| c.host.clone()),
                host: c.host.clone(),
                api_port: c.api_port.or(self.defaults.api_port).unwrap_or(9100),
                env: c.env.clone().unwrap_or_else(|| self.defaults.env.clone()),
                workloads: c
                    .workloads
                    .clone()
                    .unwrap_or_else(|| self.defaults.workloads.clone()),
            })
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<ResolvedClient> {
        self.resolve().into_iter().find(|c| c.name == name)
    }
}
