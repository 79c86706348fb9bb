//! The `.mctl-version` marker file.
//!
//! Deployments write a single version line into the parent of the node's
//! config directory; the daemon reads it at boot and on every reload so
//! heartbeats report what is actually on disk.

use std::path::Path;

pub const VERSION_FILE: &str = ".mctl-version";

/// Read the deployed version marker next to the config directory.
/// Absent or empty file means no known version.
pub fn read_deployed_version(config_dir: &Path) -> Option<String> {
    let path = config_dir.parent()?.join(VERSION_FILE);
    let text = std::fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
