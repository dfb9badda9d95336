//! Connection handler module
//!
//! Handles individual client connections. CONNECT requests are read off
//! the raw stream and tunneled directly; as soon as anything else arrives
//! the connection is handed to the HTTP server, which forwards requests and
//! can still upgrade a later CONNECT.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{HeaderMap, Method, Request, Response, StatusCode, Version};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use super::forward::{empty_body, error_header_value, error_response, ForwardingHandler, ProxyBody, PROXY_ERROR_HEADER};
use super::tunnel::{TunnelHandler, TunnelOutcome};
use crate::auth::{AuthChain, AuthFlow, ConnectionContext, HttpResponseSink};
use crate::common::{ProxyError, Result};
use crate::transport::{peek_request_head, write_status, Prebuffered, CONNECTION_ESTABLISHED, MAX_HEAD_LEN};

/// Serves client connections of the front listeners
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    auth: AuthChain,
    tunnel: TunnelHandler,
    forwarder: ForwardingHandler,
}

impl ConnectionHandler {
    /// Create a handler
    pub fn new(auth: AuthChain, tunnel: TunnelHandler, forwarder: ForwardingHandler) -> Self {
        Self {
            auth,
            tunnel,
            forwarder,
        }
    }

    /// Handle a single client connection
    ///
    /// # Parameters
    ///
    /// * `stream` - Client stream, already decrypted for the TLS listener
    /// * `peer` - Client address
    /// * `secure` - Whether the client reached the proxy over TLS
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` once the client is done, or the error that ended
    /// the connection.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr, secure: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut ctx = ConnectionContext::new(peer);
        let mut stream = Prebuffered::new(stream, MAX_HEAD_LEN);

        loop {
            let (len, head) = match peek_request_head(&mut stream).await {
                Ok(Some(parsed)) => parsed,
                Ok(None) => return Ok(()),
                Err(ProxyError::Protocol(message)) => {
                    warn!("Malformed request from {}: {}", peer, message);
                    let mut headers = HeaderMap::new();
                    headers.insert(PROXY_ERROR_HEADER, error_header_value(&message));
                    write_status(&mut stream, Version::HTTP_11, StatusCode::BAD_REQUEST, None, &headers).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if head.method != Method::CONNECT {
                // Buffered bytes are replayed to the HTTP server
                return self.serve_http(stream, ctx, secure).await;
            }

            stream.discard(len);
            match self.tunnel.handle(&mut stream, &head, &mut ctx).await? {
                TunnelOutcome::Challenged => debug!("Waiting for {} to retry CONNECT", peer),
                _ => return Ok(()),
            }
        }
    }

    async fn serve_http<S>(self: Arc<Self>, stream: Prebuffered<S>, ctx: ConnectionContext, secure: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = Arc::new(Mutex::new(ctx));
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            async move { Ok::<_, Infallible>(handler.handle_request(req, &ctx, secure).await) }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await?;
        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        ctx: &Mutex<ConnectionContext>,
        secure: bool,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req, ctx).await;
        }

        let (parts, body) = req.into_parts();
        let mut sink = HttpResponseSink::new();
        let flow = {
            let mut ctx = ctx.lock().await;
            self.auth.run(&parts, &mut sink, &mut ctx).await
        };
        if let Some(response) = stop_response(flow, sink) {
            return response;
        }

        self.forwarder.forward(Request::from_parts(parts, body), secure).await
    }

    /// CONNECT received by the HTTP server, answered through an upgrade
    async fn handle_connect(&self, mut req: Request<Incoming>, ctx: &Mutex<ConnectionContext>) -> Response<ProxyBody> {
        let upgrade = hyper::upgrade::on(&mut req);
        let (parts, _) = req.into_parts();

        let target = match TunnelHandler::parse_target(&parts) {
            Ok(target) => target,
            Err(e) => {
                warn!("TUNNEL> rejecting CONNECT {}: {}", parts.uri, e);
                return error_response(e.status_code(), &e.to_string());
            }
        };

        let mut sink = HttpResponseSink::new();
        let flow = {
            let mut ctx = ctx.lock().await;
            self.tunnel.authenticate(&parts, &mut sink, &mut ctx).await
        };
        if let Some(response) = stop_response(flow, sink) {
            return response;
        }

        let upstream = match self.tunnel.connect_upstream(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("TUNNEL> {} failed: {}", target, e);
                return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        };

        let tunnel = self.tunnel.clone();
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = tunnel.relay(TokioIo::new(upgraded), upstream, &target).await {
                        warn!("TUNNEL> {} relay broke: {}", target, e);
                    }
                }
                Err(e) => warn!("TUNNEL> {} upgrade failed: {}", target, e),
            }
        });

        let mut response = Response::new(empty_body());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(CONNECTION_ESTABLISHED.as_bytes()));
        response
    }
}

/// Response to send when authentication did not let the request through
fn stop_response(flow: Result<AuthFlow>, sink: HttpResponseSink) -> Option<Response<ProxyBody>> {
    match flow {
        Ok(AuthFlow::Continue) => None,
        Ok(_) => Some(
            sink.into_response()
                .map(|response| response.map(|_| empty_body()))
                .unwrap_or_else(|| error_response(StatusCode::FORBIDDEN, "Authentication failed")),
        ),
        Err(e) => Some(error_response(e.status_code(), &e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthProtocol, BasicAuth};
    use crate::proxy::tunnel::TunnelMode;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn handler(auth: AuthChain) -> Arc<ConnectionHandler> {
        let forwarder = ForwardingHandler::new(Duration::from_secs(2)).unwrap();
        let tunnel = TunnelHandler::new(auth.clone(), TunnelMode::Relay, Duration::from_secs(2), 1024);
        Arc::new(ConnectionHandler::new(auth, tunnel, forwarder))
    }

    async fn exchange(handler: Arc<ConnectionHandler>, request: &[u8]) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let task = tokio::spawn(handler.handle_connection(server, peer, false));

        client.write_all(request).await.unwrap();

        let mut answer = Vec::new();
        client.read_to_end(&mut answer).await.unwrap();
        let _ = task.await.unwrap();
        String::from_utf8_lossy(&answer).into_owned()
    }

    #[tokio::test]
    async fn test_garbage_is_bad_request() {
        let answer = exchange(handler(AuthChain::default()), b"\x01\x02 not http\r\n\r\n").await;
        assert!(answer.starts_with("HTTP/1.1 400 "), "{}", answer);
    }

    #[tokio::test]
    async fn test_plain_request_needs_basic_credentials() {
        let auth = AuthChain::new(vec![AuthProtocol::Basic(BasicAuth)]).unwrap();
        let answer = exchange(
            handler(auth),
            b"GET http://example.invalid/ HTTP/1.1\r\nHost: example.invalid\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(answer.starts_with("HTTP/1.1 407 "), "{}", answer);
        assert!(answer.to_ascii_lowercase().contains("proxy-authenticate: basic"));
    }

    #[tokio::test]
    async fn test_origin_form_on_plain_listener_is_bad_request() {
        let answer = exchange(
            handler(AuthChain::default()),
            b"GET /index.html HTTP/1.1\r\nHost: example.invalid\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(answer.starts_with("HTTP/1.1 400 "), "{}", answer);
    }

    #[tokio::test]
    async fn test_challenge_then_retry_on_same_connection() {
        let auth = AuthChain::new(vec![AuthProtocol::Basic(BasicAuth)]).unwrap();
        let answer = exchange(
            handler(auth),
            b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\
              CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Basic dW5rbm93bjp4\r\n\r\n",
        )
        .await;
        assert!(answer.starts_with("HTTP/1.1 407 "), "{}", answer);
        // "unknown:x" is answered on the same connection
        assert!(answer.contains("HTTP/1.1 403 "), "{}", answer);
    }
}
