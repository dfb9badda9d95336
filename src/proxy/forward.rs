//! Origin forwarding
//!
//! Plain proxy requests and requests decrypted by an intercepting listener
//! both end up here: the absolute target URL is resolved, hop-by-hop
//! headers are dropped and the request is replayed against the origin.

use std::convert::Infallible;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{HeaderName, CONNECTION, HOST};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{ProxyError, Result};

/// Response body type used by every HTTP path of the proxy
///
/// Origin responses are streamed through as they arrive.
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Header carrying the reason of a proxy-generated error response
pub const PROXY_ERROR_HEADER: &str = "x-proxy-error";

/// Headers that only apply to a single connection
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards HTTP requests to their origin
#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    client: reqwest::Client,
}

impl ForwardingHandler {
    /// Create a handler whose origin connections time out after `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    /// Create a handler around an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Resolve the absolute URL a request is meant for
    ///
    /// Absolute-form targets are used as they are. Origin-form targets are
    /// only meaningful on a TLS-terminated connection, where they are
    /// completed as `https` from the `Host` header.
    pub fn resolve_target_url(head: &Parts, secure: bool) -> Result<String> {
        let uri = &head.uri;
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Ok(uri.to_string());
        }
        if !secure {
            return Err(ProxyError::Protocol(format!(
                "Proxy requests need an absolute URI, got {}",
                uri
            )));
        }

        let host = head
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::Protocol("Missing Host header".to_string()))?;
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        Ok(format!("https://{}{}", host, path))
    }

    /// Forward a request to its origin and return the origin's response
    ///
    /// Upstream failures are logged and answered with `502`.
    pub async fn forward<B>(&self, req: Request<B>, secure: bool) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let url = match Self::resolve_target_url(&parts, secure) {
            Ok(url) => url,
            Err(e) => return error_response(e.status_code(), &e.to_string()),
        };

        let method = parts.method.clone();
        match self.send(parts, body, &url).await {
            Ok(response) => {
                info!("{} {} {}", method, url, response.status().as_u16());
                response
            }
            Err(e) => {
                warn!("Error while proxying request {} {}: {}", method, url, e);
                error_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }

    async fn send<B>(&self, parts: Parts, body: B, url: &str) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);

        // Content-Length, when the client sent one, frames the streamed body
        let mut request = self.client.request(parts.method, url).headers(headers);
        if !body.is_end_stream() {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = request
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let stream = upstream.bytes_stream().map_ok(Frame::data).map_err(io::Error::other);
        let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Serve HTTP/1.1 on a decrypted connection, forwarding every request
    pub async fn serve_connection<S>(&self, stream: S, secure: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move {
                if req.method() == Method::CONNECT {
                    debug!("Refusing nested CONNECT to {}", req.uri());
                    return Ok::<_, Infallible>(error_response(
                        StatusCode::BAD_REQUEST,
                        "CONNECT is not supported on an intercepted connection",
                    ));
                }
                Ok(handler.forward(req, secure).await)
            }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await?;
        Ok(())
    }
}

/// Remove hop-by-hop headers, including those named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Body of a proxy-generated response
pub fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never: Infallible| match never {}).boxed_unsync()
}

/// Bodiless response carrying `message` in the error header
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(PROXY_ERROR_HEADER, error_header_value(message));
    response
}

/// Header-safe rendering of an error message
pub fn error_header_value(message: &str) -> HeaderValue {
    let sanitized: String = message
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { ' ' })
        .collect();
    HeaderValue::from_str(&sanitized).unwrap_or_else(|_| HeaderValue::from_static("proxy error"))
}
