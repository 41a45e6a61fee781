//! Error types for configuration loading

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("circular include detected: {path}")]
    CircularInclude { path: PathBuf },

    #[error("secret '{key}' not found in secrets.yaml")]
    SecretNotFound { key: String },

    /// A value was rejected by a validator; fatal for the section it
    /// belongs to
    #[error("invalid configuration for '{key}': {reason}")]
    InvalidConfiguration { key: String, reason: String },

    #[error("config directory {path} is not usable: {reason}")]
    ConfigDir { path: PathBuf, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl ToString) -> Self {
        ConfigError::InvalidConfiguration {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
