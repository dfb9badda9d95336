//! Proxy server module
//!
//! Binds the front listeners, plain on the configured port and TLS on the
//! next one when enabled, and dispatches every accepted client to the
//! connection handler.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use log::{debug, error, info};
use openssl::ssl::{Ssl, SslAcceptor};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_openssl::SslStream;

use super::forward::ForwardingHandler;
use super::handler::ConnectionHandler;
use super::message::{create_channel, ProxyHandle, ProxyMessage};
use super::tunnel::{TunnelHandler, TunnelMode};
use crate::auth::AuthChain;
use crate::common::{ProxyError, Result};
use crate::config::ProxyConfig;
use crate::mitm::ServerManager;
use crate::tls::{create_tls_acceptor, CertificateProvider};

/// Proxy server
///
/// Holds the validated configuration and, when interception is on, the
/// certificate provider backing the intercepting listeners.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    provider: Option<Arc<CertificateProvider>>,
}

impl Proxy {
    /// Create a new proxy instance
    ///
    /// The configuration is validated here, so conflicting options are
    /// refused before any socket is opened.
    ///
    /// # Parameters
    ///
    /// * `config` - Proxy configuration
    /// * `provider` - Certificate provider, required when `intercept` is set
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use fake_corp_proxy::config::ProxyConfig;
    /// # use fake_corp_proxy::proxy::Proxy;
    /// # #[tokio::main]
    /// # async fn main() -> fake_corp_proxy::Result<()> {
    /// let config = ProxyConfig {
    ///     intercept: false,
    ///     ..ProxyConfig::default()
    /// };
    /// let proxy = Proxy::new(Arc::new(config), None)?;
    /// proxy.run().await
    /// # }
    /// ```
    pub fn new(config: Arc<ProxyConfig>, provider: Option<Arc<CertificateProvider>>) -> Result<Self> {
        config.validate()?;
        if config.intercept && provider.is_none() {
            return Err(ProxyError::Config(
                "Interception is enabled but no certificate provider was given".to_string(),
            ));
        }

        Ok(Self { config, provider })
    }

    /// Bind the listeners and start serving in the background
    ///
    /// # Returns
    ///
    /// A handle carrying the bound addresses. The proxy stops when
    /// [`ProxyHandle::shutdown`] is called or every handle is dropped.
    pub async fn start(&self) -> Result<ProxyHandle> {
        let config = &self.config;

        let auth = AuthChain::from_config(config)?;
        let forwarder = ForwardingHandler::new(config.connect_timeout())?;
        let manager = match (&self.provider, config.intercept) {
            (Some(provider), true) => Some(Arc::new(ServerManager::new(Arc::clone(provider), forwarder.clone()))),
            _ => None,
        };
        let mode = match &manager {
            Some(manager) => TunnelMode::Intercept(Arc::clone(manager)),
            None => TunnelMode::Relay,
        };
        let tunnel = TunnelHandler::new(auth.clone(), mode, config.connect_timeout(), config.buffer_size);
        let handler = Arc::new(ConnectionHandler::new(auth, tunnel, forwarder));

        let http = TcpListener::bind((config.bind_address, config.port)).await?;
        let http_addr = http.local_addr()?;
        info!("Proxy listening on http://{}", http_addr);

        let https = if config.https {
            let (Some(cert), Some(key)) = (&config.cert, &config.key) else {
                return Err(ProxyError::Config("HTTPS requires both a key and a certificate".to_string()));
            };
            let acceptor = Arc::new(create_tls_acceptor(cert, key)?);
            let listener = TcpListener::bind((config.bind_address, config.https_port())).await?;
            info!("Proxy listening on https://{}", listener.local_addr()?);
            Some((listener, acceptor))
        } else {
            None
        };
        let https_addr = match &https {
            Some((listener, _)) => Some(listener.local_addr()?),
            None => None,
        };

        info!(
            "Authentication: {}; interception: {}",
            describe_auth(config),
            if manager.is_some() { "on" } else { "off" }
        );

        let (handle, receiver) = create_channel(http_addr, https_addr);
        tokio::spawn(serve(http, https, handler, manager, receiver));
        Ok(handle)
    }

    /// Run the proxy until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        let handle = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl-C, shutting down");
        handle.shutdown().await
    }
}

fn describe_auth(config: &ProxyConfig) -> &'static str {
    match (config.basic, config.ntlm) {
        (true, _) => "Basic",
        (_, true) => "NTLM",
        _ => "none",
    }
}

async fn serve(
    http: TcpListener,
    https: Option<(TcpListener, Arc<SslAcceptor>)>,
    handler: Arc<ConnectionHandler>,
    manager: Option<Arc<ServerManager>>,
    mut receiver: mpsc::Receiver<ProxyMessage>,
) {
    let mut tasks = JoinSet::new();

    loop {
        // Reap finished connections and log why they ended
        while let Some(result) = tasks.try_join_next() {
            match result {
                Ok(Err(e)) => debug!("Connection closed with error: {}", e),
                Err(e) if !e.is_cancelled() => error!("Task error: {}", e),
                _ => {}
            }
        }

        tokio::select! {
            message = receiver.recv() => match message {
                Some(ProxyMessage::Shutdown) | None => break,
            },
            accepted = http.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let handler = Arc::clone(&handler);
                    tasks.spawn(async move {
                        stream.set_nodelay(true)?;
                        handler.handle_connection(stream, peer, false).await
                    });
                }
                Err(e) => error!("Error accepting connection: {}", e),
            },
            accepted = accept_tls(https.as_ref().map(|(listener, _)| listener)) => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted TLS connection from {}", peer);
                    let handler = Arc::clone(&handler);
                    let acceptor = https.as_ref().map(|(_, acceptor)| Arc::clone(acceptor));
                    tasks.spawn(async move {
                        let Some(acceptor) = acceptor else {
                            return Ok(());
                        };
                        let stream = tls_handshake(stream, &acceptor).await?;
                        handler.handle_connection(stream, peer, true).await
                    });
                }
                Err(e) => error!("Error accepting TLS connection: {}", e),
            },
        }
    }

    tasks.abort_all();
    if let Some(manager) = manager {
        manager.shutdown();
    }
    info!("Proxy stopped");
}

async fn accept_tls(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn tls_handshake(stream: TcpStream, acceptor: &SslAcceptor) -> Result<SslStream<TcpStream>> {
    stream.set_nodelay(true)?;
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, stream)?;
    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
    debug!("TLS handshake successful");
    Ok(stream)
}
