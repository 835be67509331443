//! Engine configuration.
//!
//! Loaded from a JSON file, with secrets overridable through environment
//! variables. Validation runs once at startup and is fatal; the engine
//! never hits a configuration error at steady state.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub redmine: RedmineConfig,
    pub gitlab: GitlabConfig,
    /// Category vocabulary: names Redmine trackers and GitLab labels alike,
    /// and filters which issues are paired.
    pub category_keys: Vec<String>,
    #[serde(default)]
    pub polling: PollingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedmineConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Used when composing `Source:` lines pointing at Redmine. Defaults to
    /// `base_url`.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_custom_field_name")]
    pub custom_field_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitlabConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_jitter_seconds")]
    pub jitter_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_interval_seconds(),
            jitter_seconds: default_jitter_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub connection_string: String,
}

fn default_custom_field_name() -> String {
    "Gitlab Repo".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_jitter_seconds() -> u64 {
    5
}

impl BridgeConfig {
    /// Read, override secrets from the environment, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: BridgeConfig = serde_json::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("REDMINE_API_KEY") {
            self.redmine.api_key = key;
        }
        if let Ok(token) = std::env::var("GITLAB_TOKEN") {
            self.gitlab.token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("redmine.base_url", &self.redmine.base_url)?;
        validate_url("gitlab.base_url", &self.gitlab.base_url)?;
        if let Some(url) = &self.redmine.public_url {
            validate_url("redmine.public_url", url)?;
        }
        if let Some(url) = &self.gitlab.public_url {
            validate_url("gitlab.public_url", url)?;
        }
        if self.redmine.api_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "redmine.api_key is required (or set REDMINE_API_KEY)".to_string(),
            ));
        }
        if self.gitlab.token.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "gitlab.token is required (or set GITLAB_TOKEN)".to_string(),
            ));
        }
        if self.category_keys.is_empty() {
            return Err(ConfigError::ValidationError(
                "category_keys must name at least one category".to_string(),
            ));
        }
        if self.polling.interval_seconds < 5 {
            return Err(ConfigError::ValidationError(
                "polling.interval_seconds must be at least 5".to_string(),
            ));
        }
        if self.storage.connection_string.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.connection_string is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Base for `Source:` lines pointing at Redmine issues.
    pub fn redmine_public_url(&self) -> &str {
        self.redmine
            .public_url
            .as_deref()
            .unwrap_or(&self.redmine.base_url)
    }

    /// Base for `Source:` lines pointing at GitLab issues.
    pub fn gitlab_public_url(&self) -> &str {
        self.gitlab
            .public_url
            .as_deref()
            .unwrap_or(&self.gitlab.base_url)
    }
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|e| ConfigError::ValidationError(format!("{field} is not a valid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::ValidationError(format!(
            "{field} must be an http(s) URL"
        )));
    }
    Ok(())
}
