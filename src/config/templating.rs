//! `{{ var }}` substitution for workload YAML.
//!
//! Three variable sources, lowest to highest precedence: process
//! environment, the shared `vars.{yaml,yml}` file in the config directory,
//! and an inline top-level `vars:` block. `{{ env.NAME }}` always reads the
//! environment. Unknown variables are hard errors so a typo cannot silently
//! produce an empty string in a launch command.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

/// Render `raw` by substituting `{{ name }}` and `{{ env.NAME }}` markers.
///
/// `vars` already has shared/inline precedence applied by the caller.
pub fn render(raw: &str, vars: &BTreeMap<String, Value>) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| "unclosed '{{' in template".to_string())?;
        let token = after[..end].trim();
        out.push_str(&resolve(token, vars)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve(token: &str, vars: &BTreeMap<String, Value>) -> Result<String, String> {
    if token.is_empty() {
        return Err("empty variable reference '{{ }}'".to_string());
    }
    if let Some(env_name) = token.strip_prefix("env.") {
        return std::env::var(env_name)
            .map_err(|_| format!("undefined environment variable '{}'", env_name));
    }
    if let Some(value) = vars.get(token) {
        return Ok(value_to_string(value));
    }
    // Bare names fall back to the environment (lowest precedence source).
    std::env::var(token).map_err(|_| format!("undefined template variable '{}'", token))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Load shared variables from `vars.yaml` / `vars.yml` if present.
pub fn load_vars_file(config_dir: &Path) -> Result<BTreeMap<String, Value>, String> {
    for name in ["vars.yaml", "vars.yml"] {
        let path = config_dir.join(name);
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| format!("{}: {}", path.display(), e))?;
            let data: Value = serde_yaml::from_str(&text)
                .map_err(|e| format!("{}: invalid YAML: {}", path.display(), e))?;
            return Ok(object_entries(&data));
        }
    }
    Ok(BTreeMap::new())
}

/// Extract the top-level `vars:` block from raw YAML text.
///
/// Works line-by-line so it succeeds even when the rest of the document
/// contains template markers that make it invalid YAML.
pub fn extract_inline_vars(raw: &str) -> BTreeMap<String, Value> {
    let mut in_vars = false;
    let mut block = String::new();

    for line in raw.lines() {
        if !in_vars {
            if line.trim_end() == "vars:" {
                in_vars = true;
                block.push_str("vars:\n");
            }
            continue;
        }
        if line.trim().is_empty() || line.starts_with(' ') || line.starts_with('\t') {
            block.push_str(line);
            block.push('\n');
        } else {
            break;
        }
    }

    if block.is_empty() {
        return BTreeMap::new();
    }
    match serde_yaml::from_str::<Value>(&block) {
        Ok(data) => data
            .get("vars")
            .map(object_entries)
            .unwrap_or_default(),
        Err(_) => BTreeMap::new(),
    }
}

fn object_entries(value: &Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn renders_plain_text_unchanged() {
        let out = render("name: etl\n", &BTreeMap::new()).unwrap();
        assert_eq!(out, "name: etl\n");
    }

    #[test]
    fn substitutes_variables() {
        let out = render("url: {{ base }}/feed", &vars(&[("base", "http://x")])).unwrap();
        assert_eq!(out, "url: http://x/feed");
    }

    #[test]
    fn env_prefix_reads_environment() {
        std::env::set_var("MCTL_TEST_REGION", "eu-1");
        let out = render("region: {{ env.MCTL_TEST_REGION }}", &BTreeMap::new()).unwrap();
        assert_eq!(out, "region: eu-1");
    }

    #[test]
    fn vars_shadow_environment() {
        std::env::set_var("MCTL_TEST_SHADOWED", "from-env");
        let out = render(
            "v: {{ MCTL_TEST_SHADOWED }}",
            &vars(&[("MCTL_TEST_SHADOWED", "from-vars")]),
        )
        .unwrap();
        assert_eq!(out, "v: from-vars");
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let err = render("x: {{ nope_not_set_anywhere }}", &BTreeMap::new()).unwrap_err();
        assert!(err.contains("nope_not_set_anywhere"));
    }

    #[test]
    fn unclosed_marker_is_an_error() {
        let err = render("x: {{ oops", &BTreeMap::new()).unwrap_err();
        assert!(err.contains("unclosed"));
    }

    #[test]
    fn non_string_values_render_as_json() {
        let mut v = BTreeMap::new();
        v.insert("n".to_string(), serde_json::json!(7));
        let out = render("count: {{ n }}", &v).unwrap();
        assert_eq!(out, "count: 7");
    }

    #[test]
    fn extracts_inline_vars_block() {
        let raw = "vars:\n  region: us-2\n  rate: 10\nname: {{ region }}-etl\n";
        let v = extract_inline_vars(raw);
        assert_eq!(v.get("region"), Some(&Value::String("us-2".into())));
        assert_eq!(v.get("rate"), Some(&serde_json::json!(10)));
    }

    #[test]
    fn inline_vars_absent_yields_empty() {
        assert!(extract_inline_vars("name: etl\n").is_empty());
    }

    #[test]
    fn vars_file_loaded_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vars.yml"), "base_url: http://hub\n").unwrap();
        let v = load_vars_file(dir.path()).unwrap();
        assert_eq!(v.get("base_url"), Some(&Value::String("http://hub".into())));
    }

    #[test]
    fn vars_file_absent_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_vars_file(dir.path()).unwrap().is_empty());
    }
}
