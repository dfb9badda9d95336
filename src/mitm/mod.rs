//! TLS interception
//!
//! Ephemeral loopback listeners that terminate tunneled TLS with locally
//! issued certificates and hand the decrypted requests to the forwarder.

pub mod manager;

pub use manager::{ServerInfo, ServerManager, INTERNAL_HOSTNAME};
