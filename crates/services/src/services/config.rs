use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::approvals::DEFAULT_APPROVAL_TIMEOUT_SECS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub token: Option<String>,
    pub default_pr_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Commit worktree changes automatically when an execution exits with
    /// changes on disk.
    pub auto_commit: bool,
    pub approval_timeout_seconds: i64,
    pub notifications: NotificationConfig,
    pub github: GitHubConfig,
    pub last_app_version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_commit: true,
            approval_timeout_seconds: DEFAULT_APPROVAL_TIMEOUT_SECS,
            notifications: NotificationConfig::default(),
            github: GitHubConfig::default(),
            last_app_version: None,
        }
    }
}

/// Load the config file, falling back to defaults when missing or
/// unreadable. A malformed file is replaced rather than fatal.
pub async fn load_config_from_file(path: &Path) -> Config {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Config file at {} is invalid ({e}), using defaults", path.display());
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

pub async fn save_config_to_file(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let config = load_config_from_file(Path::new("/nonexistent/config.json")).await;
        assert!(config.auto_commit);
        assert_eq!(config.approval_timeout_seconds, DEFAULT_APPROVAL_TIMEOUT_SECS);
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let td = tempfile::TempDir::new().unwrap();
        let path = td.path().join("config.json");

        let mut config = Config::default();
        config.auto_commit = false;
        save_config_to_file(&config, &path).await.unwrap();

        let loaded = load_config_from_file(&path).await;
        assert!(!loaded.auto_commit);
    }
}
