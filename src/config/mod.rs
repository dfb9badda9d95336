//! Configuration module
//!
//! Configuration is assembled once at startup from, lowest priority first:
//! built-in defaults, an optional JSON file, `FAKE_CORP_PROXY_*` environment
//! variables and command-line flags. The result is validated and then
//! shared read-only.

pub mod defaults;
mod error;
mod validator;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use log::debug;
use serde::{Deserialize, Serialize};

pub use self::error::ConfigError;
pub use self::validator::validate_config;

use crate::common::log::effective_level;

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the front listeners bind to
    #[serde(default = "defaults::bind_address")]
    pub bind_address: IpAddr,

    /// Plain proxy port; the HTTPS listener uses `port + 1`
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Require Basic proxy authentication
    #[serde(default)]
    pub basic: bool,

    /// Require NTLM proxy authentication
    #[serde(default)]
    pub ntlm: bool,

    /// Also accept proxy connections over TLS
    #[serde(default)]
    pub https: bool,

    /// Private key for the HTTPS listener
    #[serde(default)]
    pub key: Option<PathBuf>,

    /// Certificate chain for the HTTPS listener
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Decrypt CONNECT tunnels; when off, tunnels are relayed untouched
    #[serde(default = "defaults::intercept")]
    pub intercept: bool,

    /// Directory holding the root CA and issued certificates
    #[serde(default = "defaults::ca_dir")]
    pub ca_dir: PathBuf,

    /// Upstream connect timeout in seconds
    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout: u64,

    /// Relay buffer size in bytes
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,

    /// Log level
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Log protocol details
    #[serde(default)]
    pub verbose: bool,

    /// Disable logging entirely
    #[serde(default)]
    pub silent: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: defaults::bind_address(),
            port: defaults::port(),
            basic: false,
            ntlm: false,
            https: false,
            key: None,
            cert: None,
            intercept: defaults::intercept(),
            ca_dir: defaults::ca_dir(),
            connect_timeout: defaults::connect_timeout(),
            buffer_size: defaults::buffer_size(),
            log_level: defaults::log_level(),
            verbose: false,
            silent: false,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from an optional JSON file and the environment
    ///
    /// # Parameters
    ///
    /// * `path` - JSON configuration file; it must exist when given
    ///
    /// # Returns
    ///
    /// The merged configuration, not yet validated
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Json));
        }

        let config = builder
            .add_source(Environment::with_prefix(defaults::ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize::<Self>()?;

        Ok(config)
    }

    /// Apply command-line overrides on top of this configuration
    pub fn merge(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(bind_address) = overrides.bind_address {
            self.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        self.basic |= overrides.basic;
        self.ntlm |= overrides.ntlm;
        self.https |= overrides.https;
        if let Some(key) = &overrides.key {
            self.key = Some(key.clone());
        }
        if let Some(cert) = &overrides.cert {
            self.cert = Some(cert.clone());
        }
        if overrides.no_intercept {
            self.intercept = false;
        }
        if let Some(ca_dir) = &overrides.ca_dir {
            self.ca_dir = ca_dir.clone();
        }
        if let Some(connect_timeout) = overrides.connect_timeout {
            self.connect_timeout = connect_timeout;
        }
        if let Some(log_level) = &overrides.log_level {
            self.log_level = log_level.clone();
        }
        self.verbose |= overrides.verbose;
        self.silent |= overrides.silent;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_config(self)
    }

    /// Port of the HTTPS listener
    pub fn https_port(&self) -> u16 {
        // Port 0 asks the OS for an ephemeral port on both listeners
        if self.port == 0 {
            0
        } else {
            self.port.saturating_add(1)
        }
    }

    /// Upstream connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Effective log filter after `verbose` and `silent`
    pub fn log_filter(&self) -> String {
        effective_level(&self.log_level, self.verbose, self.silent)
    }

    /// Directory holding issued leaf certificates
    pub fn certs_dir(&self) -> PathBuf {
        self.ca_dir.join("certs")
    }
}

/// Values given on the command line
///
/// Flags can only switch features on; options replace the loaded value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Listen address
    pub bind_address: Option<IpAddr>,
    /// Proxy port
    pub port: Option<u16>,
    /// Enable Basic authentication
    pub basic: bool,
    /// Enable NTLM authentication
    pub ntlm: bool,
    /// Enable the HTTPS listener
    pub https: bool,
    /// HTTPS listener key
    pub key: Option<PathBuf>,
    /// HTTPS listener certificate
    pub cert: Option<PathBuf>,
    /// Relay tunnels without interception
    pub no_intercept: bool,
    /// CA directory
    pub ca_dir: Option<PathBuf>,
    /// Connect timeout in seconds
    pub connect_timeout: Option<u64>,
    /// Log level
    pub log_level: Option<String>,
    /// Verbose logging
    pub verbose: bool,
    /// No logging
    pub silent: bool,
}
