//! Duplex stream with a controllable read-ahead buffer
//!
//! The proxy needs to look at a request head before deciding who owns the
//! connection (the raw CONNECT path or the HTTP server). [`Prebuffered`]
//! lets it read ahead, inspect, consume a prefix, and then hand the stream
//! on with whatever was not consumed replayed first.

use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Initial capacity for the internal buffer
const INITIAL_CAPACITY: usize = 4 * 1024;

/// A read-ahead wrapper around a duplex stream
///
/// Writes pass straight through to the inner stream.
pub struct Prebuffered<S> {
    inner: S,
    buf: BytesMut,
    max_len: usize,
}

impl<S: AsyncRead + Unpin> Prebuffered<S> {
    /// Wrap `inner`, buffering at most `max_len` bytes ahead
    pub fn new(inner: S, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Unconsumed buffered bytes
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Number of unconsumed buffered bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the read-ahead limit is reached
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Drop `n` bytes from the front of the buffer
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Read more data from the inner stream into the buffer
    ///
    /// Returns the number of bytes added; zero means end of stream.
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }

    /// Shared access to the inner stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Split into the unconsumed buffer and the inner stream
    pub fn into_parts(self) -> (Bytes, S) {
        (self.buf.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn buffered_bytes_are_replayed_before_inner() {
        let mut p = Prebuffered::new(Cursor::new(&b"hello world"[..]), 5);
        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"hello");
        assert!(p.is_full());

        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn discard_consumes_prefix_only() {
        let mut p = Prebuffered::new(Cursor::new(&b"abcdef"[..]), 4);
        p.buffer_more().await.unwrap();
        p.discard(2);
        assert_eq!(p.buffer(), b"cd");
        p.discard(10);
        assert!(p.is_empty());

        let mut rest = Vec::new();
        p.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut p = Prebuffered::new(client, 1024);
        p.write_all(b"ping").await.unwrap();
        p.flush().await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
