//! Utility functions for QFleet
//!
//! Provides environment-file loading for the daemon and maintenance jobs.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Candidate locations of `qfleet.env`, in lookup order:
/// 1. /usr/local/etc/qfleet/qfleet.env
/// 2. User's config directory/qfleet/qfleet.env
/// 3. ~/.config/qfleet/qfleet.env
pub fn env_file_candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/usr/local/etc/qfleet/qfleet.env")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("qfleet/qfleet.env"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/qfleet/qfleet.env"));
    }
    paths
}

/// Load environment variables from the first `qfleet.env` found.
/// Variables that are already set are left untouched.
pub fn load_env_file() {
    for path in env_file_candidates() {
        if Path::new(&path).exists() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                debug!("Loading environment from {}", path.display());
                parse_env_file(&contents);
            }
            break;
        }
    }
}

/// Parse env file contents and set environment variables (only if not already set).
/// Supports formats:
/// - `KEY=value`
/// - `export KEY=value`
/// - `KEY="quoted value"`
/// - `KEY='single quoted'`
/// - Comments starting with #
pub fn parse_env_file(contents: &str) {
    for (key, value) in parse_env_pairs(contents) {
        if std::env::var(&key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

/// Parse env file contents into key/value pairs without touching the environment
pub fn parse_env_pairs(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim().trim_matches('"').trim_matches('\'');
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
