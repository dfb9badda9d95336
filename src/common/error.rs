//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Fake Corp Proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// TLS handshake error
    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate error
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Malformed request, header or NTLM message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credentials present but refused
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// MITM listener or certificate could not be provisioned for a host
    #[error("Provisioning error for {host}: {message}")]
    Provisioning {
        /// Hostname the listener was requested for
        host: String,
        /// Underlying cause
        message: String,
    },

    /// Origin could not be reached or answered with garbage
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// HTTP serving error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl ProxyError {
    /// HTTP status a client sees when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Protocol(_) => StatusCode::BAD_REQUEST,
            ProxyError::AuthRejected(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let proxy_err: ProxyError = io_err.into();

        match proxy_err {
            ProxyError::Io(_) => {}
            _ => panic!("Should convert to IO error"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = ProxyError::Provisioning {
            host: "example.com".to_string(),
            message: "bind failed".to_string(),
        };
        let err_str = format!("{}", err);
        assert!(err_str.contains("example.com"));
        assert!(err_str.contains("bind failed"));
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(ProxyError::Protocol("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::AuthRejected("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyError::Upstream("x".into()).status_code(), StatusCode::BAD_GATEWAY);
    }
}
