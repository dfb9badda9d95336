//! Bidirectional byte relay between two duplex streams

use log::debug;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Relay bytes between `client` and `upstream` until the relay is done
///
/// A client half-close is passed upstream and the response direction is
/// drained until upstream closes too. The relay ends as soon as upstream
/// reaches end of stream. An I/O error in either direction fails the
/// whole relay.
///
/// # Parameters
///
/// * `client` - Client-facing stream
/// * `upstream` - Origin or loopback stream
/// * `buffer_size` - Copy buffer size for each direction
///
/// # Returns
///
/// Bytes moved client to upstream and upstream to client. When upstream
/// closes first, the client to upstream count is the one observed before
/// the relay stopped.
pub async fn splice<A, B>(client: A, upstream: B, buffer_size: usize) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_reader, mut client_writer) = io::split(client);
    let (mut upstream_reader, mut upstream_writer) = io::split(upstream);

    let mut sent = 0u64;
    let mut received = 0u64;

    {
        let client_to_upstream = copy_half(&mut client_reader, &mut upstream_writer, buffer_size, &mut sent);
        let upstream_to_client = copy_half(&mut upstream_reader, &mut client_writer, buffer_size, &mut received);
        tokio::pin!(upstream_to_client);

        let client_closed = tokio::select! {
            res = client_to_upstream => res.map(|_| true),
            res = &mut upstream_to_client => res.map(|_| false),
        }?;

        if client_closed {
            debug!("Client to upstream closed, draining upstream");
            upstream_to_client.await?;
        } else {
            debug!("Upstream to client closed");
        }
    }

    debug!("Client to upstream transferred {} bytes total", sent);
    debug!("Upstream to client transferred {} bytes total", received);

    Ok((sent, received))
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            // Pass the half-close on; the peer may already be gone
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}
