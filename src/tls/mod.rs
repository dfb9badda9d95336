//! TLS handling module
//!
//! Root CA management, on-demand leaf certificates, acceptors for the HTTPS
//! proxy listener and for intercepting listeners, and ClientHello peeking.

mod acceptor;
pub mod ca;
pub mod provider;
pub mod sni;

pub use acceptor::{create_intercepting_acceptor, create_tls_acceptor};
pub use ca::RootAuthority;
pub use provider::{CertificateProvider, CertificateRecord};
pub use sni::{parse_client_hello_sni, peek_server_name, SniParse};
