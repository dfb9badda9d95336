//! Default configuration values
//!
//! Single source of truth for defaults, shared by serde and the CLI.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "FAKE_CORP_PROXY";

/// Default proxy port; the HTTPS listener uses the next port
pub const PORT: u16 = 8080;

/// Default directory holding the root CA and issued certificates
pub const CA_DIR_STR: &str = ".fake-corp-proxy";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default connect timeout in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default relay buffer size in bytes
pub const BUFFER_SIZE: usize = 8192;

/// Default listen address
pub fn bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Default proxy port
pub fn port() -> u16 {
    PORT
}

/// TLS interception is on unless explicitly disabled
pub fn intercept() -> bool {
    true
}

/// Default CA directory
pub fn ca_dir() -> PathBuf {
    PathBuf::from(CA_DIR_STR)
}

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

/// Default connect timeout in seconds
pub fn connect_timeout() -> u64 {
    CONNECT_TIMEOUT_SECS
}

/// Default relay buffer size
pub fn buffer_size() -> usize {
    BUFFER_SIZE
}
