//! Engine configuration.

use crate::error::{ConvoyError, Result};
use crate::lifecycle::ControllerSettings;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Persistent configuration for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Docker-compatible client to invoke
    pub runtime_binary: String,
    /// Grace period before a stopped container is killed
    pub stop_grace_secs: u64,
    /// Upper bound for bringing up one level
    pub level_timeout_secs: u64,
    /// Upper bound for a `service_healthy` dependency to turn healthy
    pub health_timeout_secs: u64,
    /// Concurrent workers per level
    pub max_parallel: usize,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
            stop_grace_secs: 10,
            level_timeout_secs: 300,
            health_timeout_secs: 60,
            max_parallel: 8,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from disk, then apply `CONVOY_*` overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&paths::config_path())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file without overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConvoyError::IoError { path: path.to_path_buf(), source: e })?;
        serde_json::from_str(&content).map_err(|e| ConvoyError::InvalidConfig {
            reason: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    /// Apply overrides looked up by variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(binary) = lookup("CONVOY_RUNTIME") {
            self.runtime_binary = binary;
        }
        if let Some(level) = lookup("CONVOY_LOG_LEVEL") {
            self.log_level = level;
        }
        override_number(&lookup, "CONVOY_STOP_GRACE_SECS", &mut self.stop_grace_secs)?;
        override_number(&lookup, "CONVOY_LEVEL_TIMEOUT_SECS", &mut self.level_timeout_secs)?;
        override_number(&lookup, "CONVOY_HEALTH_TIMEOUT_SECS", &mut self.health_timeout_secs)?;
        override_number(&lookup, "CONVOY_MAX_PARALLEL", &mut self.max_parallel)?;
        Ok(())
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_binary.trim().is_empty() {
            return Err(ConvoyError::InvalidConfig { reason: "runtime_binary is empty".into() });
        }
        if self.max_parallel == 0 {
            return Err(ConvoyError::InvalidConfig {
                reason: "max_parallel must be at least 1".into(),
            });
        }
        if self.level_timeout_secs == 0 {
            return Err(ConvoyError::InvalidConfig {
                reason: "level_timeout_secs must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn level_timeout(&self) -> Duration {
        Duration::from_secs(self.level_timeout_secs)
    }

    /// Controller timings derived from this configuration.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            health_timeout: Duration::from_secs(self.health_timeout_secs),
            ..ControllerSettings::default()
        }
    }
}

fn override_number<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConvoyError::InvalidConfig {
            reason: format!("{} must be a non-negative integer, got '{}'", key, raw),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.runtime_binary, "docker");
        assert_eq!(config.stop_grace_secs, 10);
        assert_eq!(config.max_parallel, 8);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"runtime_binary": "podman", "max_parallel": 2}"#).unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.runtime_binary, "podman");
        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.level_timeout_secs, 300);
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = EngineConfig::load_from(Path::new("/nonexistent/convoy.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(ConvoyError::InvalidConfig { .. })));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([("CONVOY_STOP_GRACE_SECS", "3"), ("CONVOY_RUNTIME", "nerdctl")]);
        let mut config = EngineConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.stop_grace_secs, 3);
        assert_eq!(config.runtime_binary, "nerdctl");
        assert_eq!(config.controller_settings().stop_grace, Duration::from_secs(3));
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|k| (k == "CONVOY_MAX_PARALLEL").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CONVOY_MAX_PARALLEL"));
    }

    #[test]
    fn test_zero_parallelism_is_invalid() {
        let config = EngineConfig { max_parallel: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
