//! Fresh Configuration Module
//! Handles loading and validating fresh.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::updater::download::RetryPolicy;

pub const CONFIG_FILE: &str = "fresh.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Package-level update configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Application id looked up in the remote manifest
    pub id: String,
    /// Shipped bundle, relative to the application root
    #[serde(default = "default_fallback_bundle_path")]
    pub fallback_bundle_path: PathBuf,
    pub update_url: String,
    /// Milliseconds to wait after start before the first automatic check
    #[serde(default = "default_auto_update_delay")]
    pub auto_update_delay: u64,
    /// Seconds between automatic checks
    #[serde(default = "default_auto_update_interval")]
    pub auto_update_interval: i64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_keep_bundles")]
    pub keep_bundles: usize,
    /// Seconds allowed for connecting and for each wait on response data
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_fallback_bundle_path() -> PathBuf {
    PathBuf::from("bundle")
}

fn default_auto_update_delay() -> u64 {
    5000
}

fn default_auto_update_interval() -> i64 {
    21600
}

fn default_keep_bundles() -> usize {
    3
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl EngineConfig {
    pub fn new(id: &str, update_url: &str) -> Self {
        Self {
            id: id.to_string(),
            fallback_bundle_path: default_fallback_bundle_path(),
            update_url: update_url.to_string(),
            auto_update_delay: default_auto_update_delay(),
            auto_update_interval: default_auto_update_interval(),
            retry: RetryPolicy::default(),
            keep_bundles: default_keep_bundles(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Load `fresh.config.json` from an application root.
    pub fn load(app_root: &Path) -> Result<Self, ConfigError> {
        Self::load_file(&app_root.join(CONFIG_FILE))
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, app_root: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(app_root.join(CONFIG_FILE), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("id must not be empty".into()));
        }
        if self.update_url.trim().is_empty() {
            return Err(ConfigError::Invalid("updateUrl must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.maxAttempts must be at least 1".into()));
        }
        if self.keep_bundles == 0 {
            return Err(ConfigError::Invalid("keepBundles must be at least 1".into()));
        }
        Ok(())
    }
}

/// What the host application supplies to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Writable directory owned by the engine
    pub data_dir: PathBuf,
    /// The running application's own version
    pub app_version: String,
    /// Directory the fallback bundle path is relative to
    pub app_root: PathBuf,
}

impl HostContext {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        app_version: &str,
        app_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            app_version: app_version.to_string(),
            app_root: app_root.into(),
        }
    }

    /// Default per-application data directory.
    pub fn default_data_dir(id: &str) -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fresh")
            .join(id)
    }

    pub fn fallback_path(&self, config: &EngineConfig) -> PathBuf {
        self.app_root.join(&config.fallback_bundle_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"id":"app","updateUrl":"https://u/manifest.json"}"#).unwrap();
        assert_eq!(config, EngineConfig::new("app", "https://u/manifest.json"));
        assert_eq!(config.auto_update_delay, 5000);
        assert_eq!(config.auto_update_interval, 21600);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.keep_bundles, 3);
    }

    #[test]
    fn test_load_save_and_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path()),
            Err(ConfigError::NotFound(_))
        ));

        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path()),
            Err(ConfigError::ParseError(_))
        ));

        let mut config = EngineConfig::new("app", "https://u");
        config.keep_bundles = 5;
        config.save(dir.path()).unwrap();
        assert_eq!(EngineConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::new("", "https://u");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.id = "app".into();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.retry.max_attempts = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fallback_path_is_relative_to_app_root() {
        let config = EngineConfig::new("app", "https://u");
        let host = HostContext::new("/data", "1.0.0", "/opt/app");
        assert_eq!(host.fallback_path(&config), PathBuf::from("/opt/app/bundle"));
    }
}
