//! Typed engine configuration.
//!
//! The engine consumes these values; it does not own where they come from.
//! Validation aggregates every problem into one multi-line error so a bad
//! deployment surfaces the full list at startup instead of failing
//! one field at a time.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Window-store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix applied to every window key, namespacing this deployment.
    pub key_prefix: String,
    /// TTL granted to idle window groups before cleanup may drop them.
    pub default_ttl_secs: u64,
    /// Upper bound on any rule's aggregation window; larger rules are
    /// rejected at load time.
    pub max_window_secs: u64,
    /// How often fully expired groups are purged.
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            key_prefix: "corvus:".to_string(),
            default_ttl_secs: 3_600,
            max_window_secs: 86_400,
            cleanup_interval_secs: 300,
        }
    }
}

/// Event stream settings (consumed by the transport implementation).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub endpoint: String,
    pub topic: String,
    pub consumer_group: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            endpoint: String::new(),
            topic: "security-events".to_string(),
            consumer_group: "corvus-engine".to_string(),
        }
    }
}

/// Rule directory settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    pub directory: PathBuf,
    #[serde(default = "default_reload_debounce")]
    pub reload_debounce_secs: u64,
}

fn default_reload_debounce() -> u64 {
    30
}

/// Alert persistence settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// SQLite database path; in-memory persistence when unset.
    pub database_path: Option<PathBuf>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    pub rules: RulesConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

impl EngineConfig {
    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, collecting all problems before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.store.key_prefix.is_empty() {
            problems.push("store.key_prefix must not be empty".to_string());
        }
        if self.store.max_window_secs == 0 {
            problems.push("store.max_window_secs must be greater than zero".to_string());
        }
        if self.store.cleanup_interval_secs == 0 {
            problems.push("store.cleanup_interval_secs must be greater than zero".to_string());
        }
        if self.store.default_ttl_secs == 0 {
            problems.push("store.default_ttl_secs must be greater than zero".to_string());
        }

        if self.stream.topic.is_empty() {
            problems.push("stream.topic must not be empty".to_string());
        }
        if self.stream.consumer_group.is_empty() {
            problems.push("stream.consumer_group must not be empty".to_string());
        }

        if self.rules.directory.as_os_str().is_empty() {
            problems.push("rules.directory must be set".to_string());
        } else if !self.rules.directory.is_dir() {
            problems.push(format!(
                "rules.directory '{}' does not exist or is not a directory",
                self.rules.directory.display()
            ));
        }
        if self.rules.reload_debounce_secs == 0 {
            problems.push("rules.reload_debounce_secs must be greater than zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
