//! HTTP/1.x head parsing and status-line writing on raw streams

use std::io;

use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::request::Parts;
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::Prebuffered;
use crate::common::{ProxyError, Result};

/// Upper bound on the number of request headers accepted
const MAX_HEADERS: usize = 64;

/// Reason phrase used for a successful CONNECT
pub const CONNECTION_ESTABLISHED: &str = "Connection Established";

/// Read and parse a request head without consuming it
///
/// Returns the head length and the parsed head, or `None` if the peer
/// closed the connection before sending anything.
pub async fn peek_request_head<S>(reader: &mut Prebuffered<S>) -> Result<Option<(usize, Parts)>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !reader.is_empty() {
            if let Some(parsed) = parse_request_head(reader.buffer())? {
                return Ok(Some(parsed));
            }
        }

        if reader.is_full() {
            return Err(ProxyError::Protocol("Request head too large".to_string()));
        }

        if reader.buffer_more().await? == 0 {
            if reader.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed in the middle of a request head",
            )));
        }
    }
}

/// Parse a request head from a buffer; `None` when incomplete
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(usize, Parts)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(buf)
        .map_err(|e| ProxyError::Protocol(format!("Invalid HTTP request: {}", e)))?;

    let len = match status {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let method = req
        .method
        .ok_or_else(|| ProxyError::Protocol("Missing HTTP method".to_string()))?;
    let path = req
        .path
        .ok_or_else(|| ProxyError::Protocol("Missing request target".to_string()))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = http::Request::builder()
        .method(method)
        .uri(path)
        .version(version);
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| ProxyError::Protocol(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| ProxyError::Protocol(format!("Invalid header value: {}", e)))?;
        builder = builder.header(name, value);
    }

    let (parts, ()) = builder
        .body(())
        .map_err(|e| ProxyError::Protocol(format!("Invalid request head: {}", e)))?
        .into_parts();

    Ok(Some((len, parts)))
}

/// Format an HTTP/1.x status line, CRLF included
pub fn status_line(version: Version, status: StatusCode, reason: Option<&str>) -> String {
    let version = match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let reason = reason.or(status.canonical_reason()).unwrap_or("");
    format!("{} {} {}\r\n", version, status.as_u16(), reason)
}

/// Write a complete bodiless response head to a raw stream
///
/// Non-2xx responses get `Content-Length: 0` so that keep-alive clients
/// can send their next attempt on the same connection.
pub async fn write_status<W>(
    writer: &mut W,
    version: Version,
    status: StatusCode,
    reason: Option<&str>,
    headers: &HeaderMap,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = status_line(version, status, reason).into_bytes();
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if !status.is_success() && !headers.contains_key(CONTENT_LENGTH) {
        head.extend_from_slice(b"content-length: 0\r\n");
    }
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head).await?;
    writer.flush().await
}
