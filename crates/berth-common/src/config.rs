//! Global configuration model for Berth.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BerthError, Result};

/// Root configuration shared by the runtime connection, registry client, and runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    /// Runtime endpoint (`unix://`, `tcp://` or `http://`). `None` uses local defaults.
    pub docker_host: Option<String>,
    /// Directory holding the Docker client `config.json`.
    pub docker_config_dir: PathBuf,
    /// Grace window before a stopping container is killed.
    pub stop_grace_secs: u64,
    /// Timeout applied to registry HTTP requests.
    pub registry_timeout_secs: u64,
    /// Label key used to find the containers of a run.
    pub label_key: String,
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            docker_config_dir: constants::docker_config_dir(),
            stop_grace_secs: constants::DEFAULT_STOP_GRACE_SECS,
            registry_timeout_secs: constants::DEFAULT_REGISTRY_TIMEOUT_SECS,
            label_key: constants::RUN_LABEL_KEY.to_string(),
        }
    }
}

impl BerthConfig {
    /// Loads configuration from a YAML file.
    ///
    /// Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
        serde_yaml::from_str(&content).map_err(|e| BerthError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Applies `DOCKER_HOST`, `DOCKER_CONFIG` and `BERTH_STOP_GRACE_SECS` overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if `BERTH_STOP_GRACE_SECS` is not a number.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(host) = lookup("DOCKER_HOST").filter(|h| !h.is_empty()) {
            self.docker_host = Some(host);
        }
        if let Some(dir) = lookup("DOCKER_CONFIG").filter(|d| !d.is_empty()) {
            self.docker_config_dir = PathBuf::from(dir);
        }
        if let Some(grace) = lookup("BERTH_STOP_GRACE_SECS") {
            self.stop_grace_secs = grace.trim().parse().map_err(|_| BerthError::Config {
                message: format!("BERTH_STOP_GRACE_SECS must be a number, got {grace:?}"),
            })?;
        }
        Ok(self)
    }

    /// Path of the Docker client `config.json`.
    #[must_use]
    pub fn docker_config_file(&self) -> PathBuf {
        self.docker_config_dir.join(constants::DOCKER_CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn load_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("berth.yaml");
        std::fs::write(&path, "stop_grace_secs: 3\n").expect("write");

        let cfg = BerthConfig::load(&path).expect("load");
        assert_eq!(cfg.stop_grace_secs, 3);
        assert_eq!(cfg.label_key, constants::RUN_LABEL_KEY);
        assert_eq!(cfg.registry_timeout_secs, constants::DEFAULT_REGISTRY_TIMEOUT_SECS);
    }

    #[test]
    fn load_rejects_invalid_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("berth.yaml");
        std::fs::write(&path, "stop_grace_secs: [not a number").expect("write");
        assert!(BerthConfig::load(&path).is_err());
    }

    #[test]
    fn overrides_replace_host_and_config_dir() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DOCKER_HOST", "tcp://10.0.0.1:2375"),
            ("DOCKER_CONFIG", "/tmp/docker-cfg"),
            ("BERTH_STOP_GRACE_SECS", "4"),
        ]);
        let cfg = BerthConfig::default()
            .with_overrides(|k| env.get(k).map(ToString::to_string))
            .expect("overrides");
        assert_eq!(cfg.docker_host.as_deref(), Some("tcp://10.0.0.1:2375"));
        assert_eq!(cfg.docker_config_file(), PathBuf::from("/tmp/docker-cfg/config.json"));
        assert_eq!(cfg.stop_grace_secs, 4);
    }

    #[test]
    fn overrides_reject_bad_grace() {
        let result = BerthConfig::default().with_overrides(|k| {
            (k == "BERTH_STOP_GRACE_SECS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }
}
