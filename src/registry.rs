//! Workload registry — name-indexed catalog of immutable specs.
//!
//! Only the orchestrator task mutates the registry; everything else sees
//! cloned specs through its command mailbox.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::workload::WorkloadSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Workload '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("Workload '{0}' is not registered")]
    NotRegistered(String),
}

/// Name-indexed mapping of specs. BTreeMap keeps `list_all` in stable name
/// order, which the reload diff and the API both rely on.
#[derive(Default)]
pub struct WorkloadRegistry {
    specs: BTreeMap<String, WorkloadSpec>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        WorkloadRegistry {
            specs: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, spec: WorkloadSpec) -> Result<(), RegistryError> {
        if self.specs.contains_key(&spec.name) {
            return Err(RegistryError::AlreadyRegistered(spec.name.clone()));
        }
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<WorkloadSpec, RegistryError> {
        self.specs
            .remove(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&WorkloadSpec> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn list_all(&self) -> Vec<WorkloadSpec> {
        self.specs.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
