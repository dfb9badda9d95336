//! Proxy service module
//!
//! Front listeners, per-connection dispatch, CONNECT tunnels and origin
//! forwarding. A running proxy is controlled through a message-driven
//! [`ProxyHandle`].

pub mod forward;
mod handler;
mod message;
pub mod server;
pub mod tunnel;

pub use forward::ForwardingHandler;
pub use handler::ConnectionHandler;
pub use message::{ProxyHandle, ProxyMessage};
pub use server::Proxy;
pub use tunnel::{TunnelHandler, TunnelMode, TunnelOutcome, TunnelState};
