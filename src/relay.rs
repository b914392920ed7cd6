//! Bidirectional byte relay between a client socket and an established tunnel.
//!
//! Each direction copies through a fixed buffer until its source reports EOF
//! or an error, then shuts down the write side of the opposite stream so the
//! peer sees EOF. The other direction keeps draining until it finishes too.
//! Both streams are owned by [`run`] and are closed when it returns, whatever
//! the exit path.

use crate::error::TunnelError;
use bytes::Bytes;
use log::{debug, trace};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_tunnel: u64,
    pub tunnel_to_client: u64,
}

/// Outcome of one copy direction: bytes moved, and the error that ended it, if any.
#[derive(Debug)]
struct Pumped {
    bytes: u64,
    error: Option<io::Error>,
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, label: &str) -> Pumped
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let error = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Some(e);
        }
        bytes += n as u64;
        trace!("{}: forwarded {} bytes", label, n);
    };

    // Half-close so the peer observes EOF; it may already be gone.
    if let Err(e) = writer.shutdown().await {
        trace!("{}: shutdown after copy failed: {}", label, e);
    }

    Pumped { bytes, error }
}

/// Couples `client` and `tunnel` until both directions have finished.
///
/// `early_data` is whatever the proxy sent past its response headers; it is
/// written to the client before any other tunnel bytes.
pub async fn run<C, T>(client: C, tunnel: T, early_data: Bytes) -> Result<RelayStats, TunnelError>
where
    C: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    let upstream = pump(&mut client_read, &mut tunnel_write, "client -> tunnel");

    let downstream = async {
        let mut early = 0u64;
        if !early_data.is_empty() {
            if let Err(e) = client_write.write_all(&early_data).await {
                let _ = client_write.shutdown().await;
                return Pumped { bytes: 0, error: Some(e) };
            }
            early = early_data.len() as u64;
        }
        let mut pumped = pump(&mut tunnel_read, &mut client_write, "tunnel -> client").await;
        pumped.bytes += early;
        pumped
    };

    let (up, down) = tokio::join!(upstream, downstream);

    let stats = RelayStats {
        client_to_tunnel: up.bytes,
        tunnel_to_client: down.bytes,
    };
    debug!(
        "Relay finished: {} bytes client -> tunnel, {} bytes tunnel -> client",
        stats.client_to_tunnel, stats.tunnel_to_client
    );

    // Resets at the end of a session are routine; report the first real failure.
    match [up.error, down.error]
        .into_iter()
        .flatten()
        .find(|e| !is_disconnect(e))
    {
        Some(e) => Err(TunnelError::Relay(e)),
        None => Ok(stats),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
