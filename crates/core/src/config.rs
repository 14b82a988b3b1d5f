//! Node configuration loading.

use crate::{DynamicValues, StaticSettings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Source could not be read or deserialized
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IlmConfig {
    /// Node identity
    #[serde(default)]
    pub node: NodeConfig,

    /// Static engine settings
    #[serde(default)]
    pub engine: StaticSettings,

    /// Initial dynamic settings
    #[serde(default)]
    pub dynamic: DynamicValues,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node-1".to_string(),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process memory (lost on exit)
    #[default]
    Memory,
    /// JSON files under a directory
    Json {
        /// Root directory
        path: PathBuf,
    },
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl IlmConfig {
    /// Load configuration: defaults, then an optional file, then `ILM_` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `ILM_DYNAMIC__EXECUTION_PERIOD_MS`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&IlmConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ILM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: IlmConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::Invalid("node.name must not be empty".to_string()));
        }
        if self.engine.thread_pool_size == 0 {
            return Err(ConfigError::Invalid("engine.thread_pool_size must be at least 1".to_string()));
        }
        if self.dynamic.execution_period_ms == 0 {
            return Err(ConfigError::Invalid("dynamic.execution_period_ms must be at least 1".to_string()));
        }
        Ok(())
    }
}
