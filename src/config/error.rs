//! Configuration errors

use std::path::PathBuf;

use thiserror::Error;

use crate::common::ProxyError;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Error loading or parsing a configuration source
    #[error("Error parsing configuration: {0}")]
    ParseError(String),

    /// Invalid value for configuration option
    #[error("Invalid value for '{0}': {1}")]
    InvalidValue(String, String),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingRequiredValue(String),

    /// Invalid combination of configuration options
    #[error("Invalid combination of configuration options: {0}")]
    InvalidCombination(String),
}

/// Result type alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<ConfigError> for ProxyError {
    fn from(err: ConfigError) -> Self {
        ProxyError::Config(err.to_string())
    }
}
