//! Directory walker that turns YAML files into validated [`WorkloadSpec`]s.
//!
//! `inventory.*`, `daemon.*`, and `vars.*` files share the config directory
//! but are not workload definitions, so they are skipped here. Any parse,
//! render, or validation failure aborts the whole load with a
//! [`ConfigError`] — reload must be atomic, and a half-applied config
//! directory is worse than a stale one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::schema::{MultiWorkloadConfig, WorkloadConfig};
use crate::config::templating;
use crate::config::ConfigError;
use crate::workload::WorkloadSpec;

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        ConfigLoader {
            config_dir: config_dir.into(),
        }
    }

    /// Load every workload definition under the config directory
    /// (recursively, sorted by path). `known_types` gates the `type` field.
    pub fn load_all(
        &self,
        known_types: Option<&BTreeSet<String>>,
    ) -> Result<Vec<WorkloadSpec>, ConfigError> {
        if !self.config_dir.is_dir() {
            return Err(ConfigError::new(
                &self.config_dir,
                "config directory does not exist",
            ));
        }

        let shared_vars = templating::load_vars_file(&self.config_dir)
            .map_err(|e| ConfigError::new(&self.config_dir, e))?;

        let mut paths = Vec::new();
        collect_yaml_files(&self.config_dir, &mut paths)
            .map_err(|e| ConfigError::new(&self.config_dir, e))?;
        paths.sort();

        let mut specs: Vec<WorkloadSpec> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for path in paths {
            for spec in self.load_file(&path, &shared_vars, known_types)? {
                if !seen.insert(spec.name.clone()) {
                    return Err(ConfigError::new(
                        &path,
                        format!("duplicate workload name '{}'", spec.name),
                    ));
                }
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    /// Load one file: render templates, parse, validate, produce specs.
    pub fn load_file(
        &self,
        path: &Path,
        shared_vars: &BTreeMap<String, Value>,
        known_types: Option<&BTreeSet<String>>,
    ) -> Result<Vec<WorkloadSpec>, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(path, format!("read failed: {}", e)))?;

        // Inline vars win over the shared file; both win over environment.
        let mut vars = shared_vars.clone();
        vars.extend(templating::extract_inline_vars(&raw));
        let rendered = templating::render(&raw, &vars)
            .map_err(|e| ConfigError::new(path, format!("template error: {}", e)))?;

        let mut doc: Value = serde_yaml::from_str(&rendered)
            .map_err(|e| ConfigError::new(path, format!("invalid YAML: {}", e)))?;

        if doc.is_null() {
            return Ok(Vec::new());
        }
        let Some(obj) = doc.as_object_mut() else {
            return Err(ConfigError::new(path, "expected a YAML mapping at top level"));
        };
        obj.remove("vars");

        let configs: Vec<WorkloadConfig> = if obj.contains_key("workloads") {
            let multi: MultiWorkloadConfig = serde_json::from_value(doc)
                .map_err(|e| ConfigError::new(path, format!("validation error: {}", e)))?;
            multi.workloads
        } else {
            let single: WorkloadConfig = serde_json::from_value(doc)
                .map_err(|e| ConfigError::new(path, format!("validation error: {}", e)))?;
            vec![single]
        };

        let mut specs = Vec::with_capacity(configs.len());
        for cfg in configs {
            cfg.validate(known_types).map_err(|e| {
                ConfigError::new(path, format!("workload '{}': {}", cfg.name, e))
            })?;
            specs.push(cfg.into_spec());
        }
        Ok(specs)
    }
}

/// True for files that live in the config directory but are not workload
/// definitions.
fn is_reserved_name(path: &Path) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    matches!(stem, "inventory" | "daemon" | "vars")
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| e.to_string())?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) && !is_reserved_name(&path)
        {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        std::fs::write(dir.path().join(name), content).unwrap();
    }

    const ETL: &str = "name: etl\ntype: script\nrun_mode: forever\nmodule: jobs.etl\n";

    #[test]
    fn loads_single_workload_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "etl.yaml", ETL);
        let specs = ConfigLoader::new(dir.path()).load_all(None).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "etl");
    }

    #[test]
    fn loads_multi_workload_file() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "all.yml",
            "workloads:\n  - name: a\n    type: script\n    run_mode: forever\n    module: m.a\n  - name: b\n    type: service\n    run_mode: forever\n    module: m.b\n",
        );
        let specs = ConfigLoader::new(dir.path()).load_all(None).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn skips_reserved_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "etl.yaml", ETL);
        write(&dir, "daemon.yaml", "fleet:\n  enabled: true\n");
        write(&dir, "inventory.yaml", "clients: []\n");
        write(&dir, "vars.yaml", "region: us-2\n");
        let specs = ConfigLoader::new(dir.path()).load_all(None).unwrap();
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn recurses_into_subdirectories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("team-a")).unwrap();
        std::fs::write(dir.path().join("team-a/etl.yaml"), ETL).unwrap();
        let specs = ConfigLoader::new(dir.path()).load_all(None).unwrap();
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn invalid_yaml_fails_the_whole_load() {
        let dir = TempDir::new().unwrap();
        write(&dir, "etl.yaml", ETL);
        write(&dir, "broken.yaml", "name: [unclosed\n");
        let err = ConfigLoader::new(dir.path()).load_all(None).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn validation_failure_names_the_workload() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "sync.yaml",
            "name: sync\ntype: script\nrun_mode: schedule\nmodule: m\n",
        );
        let err = ConfigLoader::new(dir.path()).load_all(None).unwrap_err();
        assert!(err.to_string().contains("workload 'sync'"));
        assert!(err.to_string().contains("'schedule'"));
    }

    #[test]
    fn duplicate_names_across_files_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.yaml", ETL);
        write(&dir, "b.yaml", ETL);
        let err = ConfigLoader::new(dir.path()).load_all(None).unwrap_err();
        assert!(err.to_string().contains("duplicate workload name 'etl'"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let err = ConfigLoader::new("/definitely/not/here")
            .load_all(None)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn empty_file_yields_no_specs() {
        let dir = TempDir::new().unwrap();
        write(&dir, "etl.yaml", ETL);
        write(&dir, "empty.yaml", "");
        let specs = ConfigLoader::new(dir.path()).load_all(None).unwrap();
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn shared_and_inline_vars_render_with_precedence() {
        let dir = TempDir::new().unwrap();
        write(&dir, "vars.yaml", "region: us-2\nmodule_root: jobs\n");
        write(
            &dir,
            "etl.yaml",
            "vars:\n  region: eu-1\nname: etl-{{ region }}\ntype: script\nrun_mode: forever\nmodule: '{{ module_root }}.etl'\n",
        );
        let specs = ConfigLoader::new(dir.path()).load_all(None).unwrap();
        assert_eq!(specs[0].name, "etl-eu-1");
        assert_eq!(specs[0].module_path, "jobs.etl");
    }

    #[test]
    fn undefined_template_variable_fails_load() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "etl.yaml",
            "name: etl-{{ mctl_nowhere_defined }}\ntype: script\nrun_mode: forever\nmodule: m\n",
        );
        let err = ConfigLoader::new(dir.path()).load_all(None).unwrap_err();
        assert!(err.to_string().contains("template error"));
    }
}
