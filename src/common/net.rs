//! Network utility functions
//!
//! This module provides utility functions for network operations.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::{ProxyError, Result};

/// A `host:port` tunnel target as carried by a CONNECT request line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    /// Hostname or IP literal, without IPv6 brackets
    pub host: String,
    /// Destination port, never zero
    pub port: u16,
}

impl TargetAddr {
    /// Whether the host is an IP literal rather than a domain name
    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }
}

impl FromStr for TargetAddr {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProxyError::Protocol(format!("Invalid CONNECT target: {:?}", s));

        if s.is_empty() || s.contains('@') || s.contains('/') {
            return Err(invalid());
        }

        let authority = http::uri::Authority::from_str(s).map_err(|_| invalid())?;
        let port = authority.port_u16().filter(|p| *p != 0).ok_or_else(invalid)?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Open a TCP connection, giving up after `connect_timeout`
pub async fn connect_with_timeout(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::Io(e)),
        Err(_) => Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("Connection to {}:{} timed out after {:?}", host, port, connect_timeout),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target: TargetAddr = "example.com:443".parse().unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert!(!target.is_ip());

        let target: TargetAddr = "10.0.0.1:8443".parse().unwrap();
        assert!(target.is_ip());
    }

    #[test]
    fn test_parse_ipv6_target() {
        let target: TargetAddr = "[::1]:443".parse().unwrap();
        assert_eq!(target.host, "::1");
        assert!(target.is_ip());
        assert_eq!(target.to_string(), "[::1]:443");
    }

    #[test]
    fn test_reject_malformed_targets() {
        for bad in ["", "example.com", "example.com:", ":443", "example.com:0",
                    "example.com:http", "user@example.com:443", "example.com:443/path",
                    "example.com:70000"] {
            let parsed = bad.parse::<TargetAddr>();
            assert!(matches!(parsed, Err(ProxyError::Protocol(_))), "{:?} should be rejected", bad);
        }
    }
}
