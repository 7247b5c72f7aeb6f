//! Centralized path resolution for convoy.

use std::path::{Path, PathBuf};

/// Manifest file names looked up in the working directory, in order.
pub const MANIFEST_NAMES: [&str; 4] =
    ["compose.yaml", "compose.yml", "docker-compose.yaml", "docker-compose.yml"];

/// Get the convoy configuration directory.
///
/// Resolution order:
/// 1. `CONVOY_CONFIG_DIR` environment variable
/// 2. `<platform config dir>/convoy`
/// 3. `~/.convoy`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CONVOY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .map(|d| d.join("convoy"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".convoy")))
        .unwrap_or_else(|| PathBuf::from(".convoy"))
}

/// Get the configuration file path (`CONVOY_CONFIG` overrides).
pub fn config_path() -> PathBuf {
    match std::env::var("CONVOY_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => config_dir().join("config.json"),
    }
}

/// Find the manifest in `dir` by its conventional names.
pub fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_NAMES.iter().map(|name| dir.join(name)).find(|path| path.is_file())
}
