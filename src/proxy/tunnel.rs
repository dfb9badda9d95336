//! CONNECT tunnels
//!
//! A tunnel goes through `Start → Authenticating → Authenticated → Tunneling`
//! and ends `Closed`, `Rejected` or `Failed`. The upstream side is acquired
//! before the client is told the tunnel is up, so a failure can still be
//! answered with a well-formed `502`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http::request::Parts;
use http::{HeaderMap, StatusCode};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::forward::{error_header_value, PROXY_ERROR_HEADER};
use crate::auth::{AuthChain, AuthFlow, ConnectionContext, ResponseSink, SocketSink};
use crate::common::{connect_with_timeout, ProxyError, Result, TargetAddr};
use crate::mitm::ServerManager;
use crate::transport::{splice, write_status, Prebuffered, CONNECTION_ESTABLISHED};

/// Where tunneled bytes go
#[derive(Clone)]
pub enum TunnelMode {
    /// Into an intercepting listener that decrypts and forwards
    Intercept(Arc<ServerManager>),
    /// Straight to the requested target
    Relay,
}

impl fmt::Debug for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelMode::Intercept(_) => f.write_str("Intercept"),
            TunnelMode::Relay => f.write_str("Relay"),
        }
    }
}

/// Tunnel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// CONNECT head received
    Start,
    /// Running the authentication chain
    Authenticating,
    /// Credentials accepted, or none required
    Authenticated,
    /// Terminal response sent
    Rejected,
    /// Relaying bytes
    Tunneling,
    /// Relay finished
    Closed,
    /// Upstream unreachable or relay broken
    Failed,
}

/// How a CONNECT attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// A challenge was sent; the client may retry on the same connection
    Challenged,
    /// A terminal error response was sent
    Rejected,
    /// The relay ran and finished
    Closed,
    /// The upstream could not be reached, or the relay broke
    Failed,
}

/// Runs CONNECT tunnels
#[derive(Debug, Clone)]
pub struct TunnelHandler {
    auth: AuthChain,
    mode: TunnelMode,
    connect_timeout: Duration,
    buffer_size: usize,
}

impl TunnelHandler {
    /// Create a handler
    ///
    /// # Parameters
    ///
    /// * `auth` - Authentication chain run for every CONNECT
    /// * `mode` - Interception or plain relay
    /// * `connect_timeout` - Bound on upstream and loopback connects
    /// * `buffer_size` - Relay buffer size per direction
    pub fn new(auth: AuthChain, mode: TunnelMode, connect_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            auth,
            mode,
            connect_timeout,
            buffer_size,
        }
    }

    /// Target of a CONNECT request head
    pub fn parse_target(head: &Parts) -> Result<TargetAddr> {
        TargetAddr::from_str(&head.uri.to_string())
    }

    /// Run the authentication chain for a CONNECT attempt
    pub async fn authenticate<K: ResponseSink>(
        &self,
        head: &Parts,
        sink: &mut K,
        ctx: &mut ConnectionContext,
    ) -> Result<AuthFlow> {
        self.auth.run(head, sink, ctx).await
    }

    /// Open the upstream side of a tunnel to `target`
    ///
    /// In intercept mode this is a loopback connection to the listener
    /// serving the target host, provisioned on first use.
    pub async fn connect_upstream(&self, target: &TargetAddr) -> Result<TcpStream> {
        match &self.mode {
            TunnelMode::Intercept(manager) => {
                let info = manager.get_or_create_listener(&target.host).await?;
                debug!("TUNNEL> {} served by intercepting listener {}", target, info.addr());
                connect_with_timeout(&info.host, info.port, self.connect_timeout).await
            }
            TunnelMode::Relay => connect_with_timeout(&target.host, target.port, self.connect_timeout).await,
        }
    }

    /// Relay bytes between an established client and its upstream
    pub async fn relay<C>(&self, client: C, upstream: TcpStream, target: &TargetAddr) -> Result<()>
    where
        C: AsyncRead + AsyncWrite,
    {
        transition(target, TunnelState::Tunneling);
        match splice(client, upstream, self.buffer_size).await {
            Ok((sent, received)) => {
                debug!("TUNNEL> {} sent {} bytes, received {} bytes", target, sent, received);
                transition(target, TunnelState::Closed);
                Ok(())
            }
            Err(e) => {
                transition(target, TunnelState::Failed);
                Err(ProxyError::Io(e))
            }
        }
    }

    /// Run a complete CONNECT exchange on a raw client stream
    ///
    /// `client` must already be positioned after the CONNECT head; bytes the
    /// client pipelined behind it are still in its buffer and are relayed
    /// first.
    pub async fn handle<S>(
        &self,
        client: &mut Prebuffered<S>,
        head: &Parts,
        ctx: &mut ConnectionContext,
    ) -> Result<TunnelOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let version = head.version;

        let target = match Self::parse_target(head) {
            Ok(target) => target,
            Err(e) => {
                warn!("TUNNEL> rejecting CONNECT {}: {}", head.uri, e);
                send_error(&mut SocketSink::new(client, version), e.status_code(), &e.to_string()).await?;
                return Ok(TunnelOutcome::Rejected);
            }
        };
        transition(&target, TunnelState::Start);

        transition(&target, TunnelState::Authenticating);
        let flow = self
            .authenticate(head, &mut SocketSink::new(client, version), ctx)
            .await?;
        match flow {
            AuthFlow::Continue => transition(&target, TunnelState::Authenticated),
            AuthFlow::Challenged => return Ok(TunnelOutcome::Challenged),
            AuthFlow::Rejected => {
                transition(&target, TunnelState::Rejected);
                return Ok(TunnelOutcome::Rejected);
            }
        }

        let upstream = match self.connect_upstream(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("TUNNEL> {} failed: {}", target, e);
                transition(&target, TunnelState::Failed);
                let mut sink = SocketSink::new(client, version);
                send_error(&mut sink, StatusCode::BAD_GATEWAY, &e.to_string()).await?;
                return Ok(TunnelOutcome::Failed);
            }
        };

        write_status(
            client,
            version,
            StatusCode::OK,
            Some(CONNECTION_ESTABLISHED),
            &HeaderMap::new(),
        )
        .await?;
        info!("TUNNEL> {} {} established", ctx.principal(), target);

        match self.relay(&mut *client, upstream, &target).await {
            Ok(()) => Ok(TunnelOutcome::Closed),
            Err(e) => {
                warn!("TUNNEL> {} relay broke: {}", target, e);
                Ok(TunnelOutcome::Failed)
            }
        }
    }
}

/// Answer with `status` and the failure reason in the error header
pub(crate) async fn send_error<K: ResponseSink>(
    sink: &mut K,
    status: StatusCode,
    message: &str,
) -> Result<()> {
    let mut headers = HeaderMap::new();
    headers.insert(PROXY_ERROR_HEADER, error_header_value(message));
    sink.send_response(status, headers).await?;
    Ok(())
}

fn transition(target: &TargetAddr, state: TunnelState) {
    debug!("TUNNEL> {} -> {:?}", target, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthProtocol, BasicAuth};
    use crate::transport::{peek_request_head, MAX_HEAD_LEN};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    fn relay_handler(auth: AuthChain) -> TunnelHandler {
        TunnelHandler::new(auth, TunnelMode::Relay, Duration::from_secs(2), 1024)
    }

    /// Feed `request` to the handler and return everything it answered
    /// before the client side stopped reading
    async fn exchange(handler: TunnelHandler, request: &[u8]) -> (TunnelOutcome, String) {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(request).await.unwrap();

        let outcome = run(handler, server).await;
        drop(client.shutdown().await);

        let mut answer = Vec::new();
        client.read_to_end(&mut answer).await.unwrap();
        (outcome, String::from_utf8(answer).unwrap())
    }

    async fn run(handler: TunnelHandler, server: DuplexStream) -> TunnelOutcome {
        let mut stream = Prebuffered::new(server, MAX_HEAD_LEN);
        let (len, head) = peek_request_head(&mut stream).await.unwrap().unwrap();
        stream.discard(len);
        let mut ctx = ConnectionContext::default();
        handler.handle(&mut stream, &head, &mut ctx).await.unwrap()
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_malformed_target_is_bad_request() {
        for target in ["no-port.example", "host:0"] {
            let request = format!("CONNECT {} HTTP/1.1\r\n\r\n", target);
            let (outcome, answer) = exchange(relay_handler(AuthChain::default()), request.as_bytes()).await;
            assert_eq!(outcome, TunnelOutcome::Rejected, "target {}", target);
            assert!(answer.starts_with("HTTP/1.1 400 "), "target {}: {}", target, answer);
        }
    }

    #[tokio::test]
    async fn test_missing_basic_credentials_challenge() {
        let auth = AuthChain::new(vec![AuthProtocol::Basic(BasicAuth)]).unwrap();
        let (outcome, answer) =
            exchange(relay_handler(auth), b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await;
        assert_eq!(outcome, TunnelOutcome::Challenged);
        assert!(answer.starts_with("HTTP/1.1 407 "));
        assert!(answer.contains("proxy-authenticate: Basic\r\n"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port);
        let (outcome, answer) = exchange(relay_handler(AuthChain::default()), request.as_bytes()).await;
        assert_eq!(outcome, TunnelOutcome::Failed);
        assert!(answer.starts_with("HTTP/1.1 502 "));
        assert!(answer.contains("x-proxy-error: "));
    }

    #[tokio::test]
    async fn test_relay_replays_pipelined_bytes() {
        let port = echo_server().await;
        let (mut client, server) = duplex(64 * 1024);

        let handler = relay_handler(AuthChain::default());
        let task = tokio::spawn(run(handler, server));

        let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\nearly bytes", port);
        client.write_all(request.as_bytes()).await.unwrap();

        let expected = b"HTTP/1.1 200 Connection Established\r\n\r\nearly bytes";
        let mut answer = vec![0u8; expected.len()];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer[..], &expected[..]);

        client.write_all(b"later").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"later");

        drop(client);
        assert_eq!(task.await.unwrap(), TunnelOutcome::Closed);
    }
}
