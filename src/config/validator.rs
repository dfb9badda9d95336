//! Configuration validator
//!
//! Runs once at startup; every error here is fatal before any socket opens.

use std::path::Path;

use super::error::{ConfigError, Result};
use super::ProxyConfig;

/// Validate the configuration
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    validate_auth_settings(config)?;
    validate_https_settings(config)?;
    validate_general_settings(config)?;
    Ok(())
}

/// Basic and NTLM exclude each other
fn validate_auth_settings(config: &ProxyConfig) -> Result<()> {
    if config.basic && config.ntlm {
        return Err(ConfigError::InvalidCombination(
            "basic and ntlm authentication cannot be enabled together".to_string(),
        ));
    }
    Ok(())
}

/// The HTTPS listener needs a key, a certificate and a port after `port`
fn validate_https_settings(config: &ProxyConfig) -> Result<()> {
    if !config.https {
        return Ok(());
    }

    let key = config
        .key
        .as_deref()
        .ok_or_else(|| ConfigError::MissingRequiredValue("key (required with https)".to_string()))?;
    let cert = config
        .cert
        .as_deref()
        .ok_or_else(|| ConfigError::MissingRequiredValue("cert (required with https)".to_string()))?;

    validate_file_exists(key)?;
    validate_file_exists(cert)?;

    if config.port == u16::MAX {
        return Err(ConfigError::InvalidValue(
            "port".to_string(),
            "HTTPS listens on port + 1, which overflows".to_string(),
        ));
    }

    Ok(())
}

/// Validate general settings
fn validate_general_settings(config: &ProxyConfig) -> Result<()> {
    if config.log_level.parse::<log::LevelFilter>().is_err() {
        return Err(ConfigError::InvalidValue(
            "log_level".to_string(),
            format!(
                "{:?} is not one of off, error, warn, info, debug, trace",
                config.log_level
            ),
        ));
    }

    if config.buffer_size == 0 {
        return Err(ConfigError::InvalidValue(
            "buffer_size".to_string(),
            "Buffer size must be greater than 0".to_string(),
        ));
    }

    if config.connect_timeout == 0 {
        return Err(ConfigError::InvalidValue(
            "connect_timeout".to_string(),
            "Connect timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_file_exists(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    Ok(())
}
