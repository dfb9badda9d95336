//! Proxy control messages
//!
//! A running proxy is controlled through a [`ProxyHandle`] that sends
//! messages to its accept loop, so no lock on the proxy itself is needed.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::common::{ProxyError, Result};

/// Messages understood by a running proxy
#[derive(Debug)]
pub enum ProxyMessage {
    /// Stop accepting, abort open connections and intercepting listeners
    Shutdown,
}

/// Control handle of a running proxy
///
/// Dropping every handle stops the proxy as well.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    sender: mpsc::Sender<ProxyMessage>,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
}

impl ProxyHandle {
    /// Address of the plain proxy listener
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Address of the TLS proxy listener, when enabled
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// Send a message to the proxy
    pub async fn send(&self, message: ProxyMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ProxyError::Other("Failed to send message to proxy service".to_string()))
    }

    /// Shut the proxy down
    pub async fn shutdown(&self) -> Result<()> {
        self.send(ProxyMessage::Shutdown).await
    }
}

/// Create the control channel for a proxy bound to the given addresses
pub fn create_channel(
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
) -> (ProxyHandle, mpsc::Receiver<ProxyMessage>) {
    let (sender, receiver) = mpsc::channel(8);
    let handle = ProxyHandle {
        sender,
        http_addr,
        https_addr,
    };
    (handle, receiver)
}
