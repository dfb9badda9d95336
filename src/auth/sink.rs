//! Response sinks for authentication protocols
//!
//! Protocols only ever need to "send a status with some headers". The same
//! protocol code runs on the HTTP server path, where the answer becomes a
//! structured response, and on the raw CONNECT path, where it is written
//! straight to the socket.

use std::future::Future;
use std::io;

use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode, Version};
use http_body_util::Full;
use tokio::io::AsyncWrite;

use crate::transport::write_status;

/// Write a bodiless status-and-headers response
pub trait ResponseSink: Send {
    /// Send `status` with `headers` to the client
    fn send_response(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

/// Sink that builds a structured HTTP response
#[derive(Debug, Default)]
pub struct HttpResponseSink {
    response: Option<Response<Full<Bytes>>>,
}

impl HttpResponseSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a response was produced
    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Take the produced response, if any
    pub fn into_response(self) -> Option<Response<Full<Bytes>>> {
        self.response
    }
}

impl ResponseSink for HttpResponseSink {
    async fn send_response(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        self.response = Some(response);
        Ok(())
    }
}

/// Sink that writes a raw HTTP/1.x response head to a stream
pub struct SocketSink<'a, W> {
    writer: &'a mut W,
    version: Version,
}

impl<'a, W> SocketSink<'a, W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Answer on `writer` using the client's HTTP `version`
    pub fn new(writer: &'a mut W, version: Version) -> Self {
        Self { writer, version }
    }
}

impl<W> ResponseSink for SocketSink<'_, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_response(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
        write_status(&mut *self.writer, self.version, status, None, &headers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::PROXY_AUTHENTICATE;
    use http::HeaderValue;

    fn challenge() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_AUTHENTICATE, HeaderValue::from_static("NTLM"));
        headers
    }

    #[tokio::test]
    async fn test_http_sink_builds_response() {
        let mut sink = HttpResponseSink::new();
        assert!(!sink.has_response());
        sink.send_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, challenge())
            .await
            .unwrap();

        let response = sink.into_response().unwrap();
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(response.headers()[PROXY_AUTHENTICATE], "NTLM");
    }

    #[tokio::test]
    async fn test_socket_sink_writes_head() {
        let mut out: Vec<u8> = Vec::new();
        let mut sink = SocketSink::new(&mut out, Version::HTTP_11);
        sink.send_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, challenge())
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(text.contains("proxy-authenticate: NTLM\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
