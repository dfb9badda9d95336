//! Pool of intercepting listeners
//!
//! One loopback TLS listener is provisioned per host key the first time a
//! tunnel needs it. IP literals get a listener of their own presenting a
//! certificate for that address; every domain name shares one listener whose
//! certificates are picked per handshake from the ClientHello's server name.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use openssl::ssl::{Ssl, SslAcceptor};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};
use crate::proxy::forward::ForwardingHandler;
use crate::tls::{create_intercepting_acceptor, peek_server_name, CertificateProvider};

/// Host key shared by every domain-name target
pub const INTERNAL_HOSTNAME: &str = "fake-corp-proxy-internal-https";

/// How long an intercepted connection may take to send its ClientHello
const SNI_PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Address of one intercepting listener
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerInfo {
    /// Loopback address the listener is bound to
    pub host: String,
    /// Port the listener is bound to
    pub port: u16,
}

impl ServerInfo {
    /// `host:port` form, suitable for connecting
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type PendingListener = Shared<BoxFuture<'static, std::result::Result<ServerInfo, Arc<ProxyError>>>>;

/// Provisions and remembers intercepting listeners
///
/// Concurrent first requests for the same host key all await one shared
/// provisioning future. The map lock is held only to look up or insert that
/// future, never while certificates are issued.
pub struct ServerManager {
    provider: Arc<CertificateProvider>,
    forwarder: ForwardingHandler,
    servers: Mutex<HashMap<String, PendingListener>>,
    tasks: Arc<Mutex<Vec<AbortHandle>>>,
}

impl ServerManager {
    /// Create an empty pool
    pub fn new(provider: Arc<CertificateProvider>, forwarder: ForwardingHandler) -> Self {
        Self {
            provider,
            forwarder,
            servers: Mutex::new(HashMap::new()),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Key under which the listener for `hostname` is pooled
    pub fn host_key(hostname: &str) -> String {
        let bare = hostname.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => INTERNAL_HOSTNAME.to_string(),
        }
    }

    /// Return the listener serving `hostname`, provisioning it on first use
    ///
    /// A failed provisioning is removed from the pool so a later call
    /// retries it.
    pub async fn get_or_create_listener(&self, hostname: &str) -> Result<ServerInfo> {
        let key = Self::host_key(hostname);

        let pending = {
            let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
            servers
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!("MITM> provisioning listener for {}", key);
                    provision(
                        Arc::clone(&self.provider),
                        self.forwarder.clone(),
                        Arc::clone(&self.tasks),
                        key.clone(),
                    )
                    .map(|result| result.map_err(Arc::new))
                    .boxed()
                    .shared()
                })
                .clone()
        };

        match pending.clone().await {
            Ok(info) => Ok(info),
            Err(e) => {
                let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
                if servers.get(&key).is_some_and(|current| current.ptr_eq(&pending)) {
                    servers.remove(&key);
                }
                error!("MITM> could not provision listener for {}: {}", hostname, e);
                Err(ProxyError::Provisioning {
                    host: hostname.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Number of listeners bound so far
    pub fn listener_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop every listener
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            task.abort();
        }
        self.servers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn provision(
    provider: Arc<CertificateProvider>,
    forwarder: ForwardingHandler,
    tasks: Arc<Mutex<Vec<AbortHandle>>>,
    key: String,
) -> Result<ServerInfo> {
    let default = provider.fetch(&key).await?;
    let acceptor = Arc::new(create_intercepting_acceptor(Arc::clone(&provider), &default)?);

    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    let addr = listener.local_addr()?;
    let info = ServerInfo {
        host: addr.ip().to_string(),
        port: addr.port(),
    };

    let task = tokio::spawn(accept_loop(listener, acceptor, provider, forwarder, key.clone()));
    tasks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(task.abort_handle());

    info!("MITM> listener for {} ready on {}", key, info.addr());
    Ok(info)
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Arc<SslAcceptor>,
    provider: Arc<CertificateProvider>,
    forwarder: ForwardingHandler,
    key: String,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("MITM> {} accepted connection from {}", key, peer);
                let acceptor = Arc::clone(&acceptor);
                let provider = Arc::clone(&provider);
                let forwarder = forwarder.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_intercepted(stream, acceptor, provider, forwarder).await {
                        debug!("MITM> connection from {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                warn!("MITM> accept failed on listener for {}: {}", key, e);
            }
        }
    }
}

/// Terminate TLS on one intercepted connection and serve the plaintext
async fn serve_intercepted(
    stream: TcpStream,
    acceptor: Arc<SslAcceptor>,
    provider: Arc<CertificateProvider>,
    forwarder: ForwardingHandler,
) -> Result<()> {
    stream.set_nodelay(true)?;

    // Issue off the runtime so the server-name callback only hits the cache
    if let Some(name) = peek_server_name(&stream, SNI_PEEK_TIMEOUT).await {
        if let Err(e) = provider.fetch(&name).await {
            error!("Error while generating SNI certificate for host {}: {}", name, e);
        }
    }

    let ssl = Ssl::new(acceptor.context())?;
    let mut tls = SslStream::new(ssl, stream)?;
    Pin::new(&mut tls)
        .accept()
        .await
        .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;

    forwarder.serve_connection(tls, true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::RootAuthority;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ServerManager {
        let authority = RootAuthority::load_or_generate(dir.path()).unwrap();
        let provider = Arc::new(CertificateProvider::new(Arc::new(authority), None));
        let forwarder = ForwardingHandler::new(Duration::from_secs(5)).unwrap();
        ServerManager::new(provider, forwarder)
    }

    #[test]
    fn test_host_key() {
        assert_eq!(ServerManager::host_key("example.com"), INTERNAL_HOSTNAME);
        assert_eq!(ServerManager::host_key("other.example"), INTERNAL_HOSTNAME);
        assert_eq!(ServerManager::host_key("10.1.2.3"), "10.1.2.3");
        assert_eq!(ServerManager::host_key("[::1]"), "::1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_listener() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(manager(&dir));

        let calls = (0..16).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_or_create_listener("shared.example").await })
        });
        let results = futures::future::join_all(calls).await;

        let infos: Vec<ServerInfo> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
        assert!(infos.iter().all(|info| info == &infos[0]));
        assert_eq!(manager.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_listeners() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let first = manager.get_or_create_listener("127.0.0.2").await.unwrap();
        let second = manager.get_or_create_listener("127.0.0.3").await.unwrap();
        let domain = manager.get_or_create_listener("a.example").await.unwrap();
        let other_domain = manager.get_or_create_listener("b.example").await.unwrap();

        assert_ne!(first, second);
        assert_ne!(first, domain);
        assert_eq!(domain, other_domain);
        assert_eq!(manager.listener_count(), 3);

        // Memoized
        assert_eq!(manager.get_or_create_listener("127.0.0.2").await.unwrap(), first);
        assert_eq!(manager.listener_count(), 3);
    }

    #[tokio::test]
    async fn test_listener_accepts_connections() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let info = manager.get_or_create_listener("localhost").await.unwrap();
        assert_eq!(info.host, "127.0.0.1");
        TcpStream::connect(info.addr()).await.unwrap();
    }
}
