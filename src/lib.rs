//! Fake Corp Proxy: an intercepting HTTP/HTTPS proxy for testing clients
//! against corporate network setups
//!
//! The proxy forwards plain HTTP requests, tunnels CONNECT requests and, when
//! interception is on, terminates tunneled TLS with certificates issued on
//! the fly by a local root CA. Proxy authentication can be required with
//! either Basic or NTLM.
//!
//! # Main Features
//!
//! - CONNECT tunnels, relayed or intercepted
//! - Per-host certificates selected through SNI
//! - Basic and NTLM proxy authentication on both raw and HTTP paths
//! - Optional TLS front listener
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fake_corp_proxy::config::ProxyConfig;
//! use fake_corp_proxy::tls::{CertificateProvider, RootAuthority};
//! use fake_corp_proxy::{Proxy, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ProxyConfig {
//!         basic: true,
//!         ..ProxyConfig::default()
//!     };
//!
//!     // Root CA and leaf certificates live under the CA directory
//!     let authority = RootAuthority::load_or_generate(&config.ca_dir)?;
//!     let provider = CertificateProvider::new(Arc::new(authority), Some(config.certs_dir()));
//!
//!     let proxy = Proxy::new(Arc::new(config), Some(Arc::new(provider)))?;
//!     proxy.run().await
//! }
//! ```

// Public modules
pub mod auth;
pub mod common;
pub mod config;
pub mod mitm;
pub mod proxy;
pub mod tls;
pub mod transport;

// Re-export commonly used structures and functions for convenience
pub use common::{ProxyError, Result};
pub use mitm::{ServerInfo, ServerManager};
pub use proxy::{Proxy, ProxyHandle};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
