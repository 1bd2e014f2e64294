//! Dialing the upstream and relaying an upgraded CONNECT connection to it.
//!
//! Dialing happens *before* the 200 response is sent, so a dead or
//! unreachable upstream surfaces as 502/504 on the CONNECT response itself
//! rather than silently dropping the tunnel after the client has already
//! started its TLS handshake.

use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{TUNNEL_IDLE_TIMEOUT, UPSTREAM_CONNECT_TIMEOUT};
use crate::error::ProxyError;

/// Dials the upstream and relays bytes once the client connection has been
/// upgraded. Exists as a trait so tests can substitute an in-memory upstream.
#[async_trait]
pub trait TunnelHandler: Send + Sync {
    /// Dial the target. Errors here must be surfaced as the CONNECT
    /// response's status (502/504) before any bytes are relayed.
    async fn dial(&self, target: &str) -> Result<TcpStream, ProxyError>;

    /// Relay bytes between the upgraded client connection and an
    /// already-dialed upstream. Runs after the 200 response has been sent.
    async fn relay(&self, req: Request<Incoming>, upstream: TcpStream, target: String);
}

/// The production tunnel: dials a real TCP socket and shuttles bytes with
/// `tokio::io::copy_bidirectional`.
#[derive(Default)]
pub struct TcpTunnelHandler;

#[async_trait]
impl TunnelHandler for TcpTunnelHandler {
    async fn dial(&self, target: &str) -> Result<TcpStream, ProxyError> {
        tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?
            .map_err(ProxyError::UpstreamFailed)
    }

    async fn relay(&self, req: Request<Incoming>, upstream: TcpStream, target: String) {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::warn!(target = %target, error = %err, "upgrade failed after 200 sent");
                return;
            }
        };
        let client = TokioIo::new(upgraded);
        let (client_r, client_w) = tokio::io::split(client);
        let (upstream_r, upstream_w) = tokio::io::split(upstream);

        let downstream = copy_with_idle_reset(client_r, upstream_w, TUNNEL_IDLE_TIMEOUT);
        let upstream_side = copy_with_idle_reset(upstream_r, client_w, TUNNEL_IDLE_TIMEOUT);

        // Whichever direction finishes first (clean EOF, a write/read error,
        // or its own idle timeout) ends the tunnel; the other half is
        // dropped and its socket closed along with it.
        tokio::select! {
            result = downstream => log_relay_result(&target, "client->upstream", result),
            result = upstream_side => log_relay_result(&target, "upstream->client", result),
        }
    }
}

fn log_relay_result(target: &str, direction: &str, result: std::io::Result<()>) {
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
            tracing::info!(target = %target, direction, "tunnel idle timeout, closing");
        }
        Err(err) => {
            tracing::debug!(target = %target, direction, error = %err, "tunnel closed with error");
        }
    }
}

/// Copy from `reader` to `writer`, resetting the idle deadline on every read
/// that returns data. Unlike wrapping the whole transfer in one `timeout`,
/// this lets an arbitrarily long-lived but continuously active tunnel run
/// forever while still closing a side that has gone quiet for `idle`.
async fn copy_with_idle_reset<R, W>(mut reader: R, mut writer: W, idle: Duration) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let read = tokio::time::timeout(idle, reader.read(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout"))??;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_unbound_port_fails_fast() {
        // Port 0 never accepts; connecting to it fails immediately rather
        // than hanging until the connect timeout.
        let result = tokio::time::timeout(Duration::from_secs(1), TcpStream::connect("127.0.0.1:0")).await;
        assert!(result.unwrap().is_err());
    }

    #[tokio::test]
    async fn dial_unbound_port_surfaces_as_upstream_failed() {
        let handler = TcpTunnelHandler;
        let result = handler.dial("127.0.0.1:0").await;
        assert!(matches!(result, Err(ProxyError::UpstreamFailed(_))));
    }

    #[tokio::test]
    async fn copy_with_idle_reset_relays_all_data_then_closes_on_eof() {
        let (src, mut src_peer) = tokio::io::duplex(64);
        let (dst, mut dst_peer) = tokio::io::duplex(64);

        let handle = tokio::spawn(copy_with_idle_reset(src, dst, Duration::from_secs(5)));
        src_peer.write_all(b"hello").await.unwrap();
        drop(src_peer);

        assert!(handle.await.unwrap().is_ok());
        let mut buf = Vec::new();
        dst_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn copy_with_idle_reset_times_out_when_no_data_arrives() {
        let (src, _src_peer) = tokio::io::duplex(64);
        let (dst, _dst_peer) = tokio::io::duplex(64);

        let result = copy_with_idle_reset(src, dst, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ref err) if err.kind() == std::io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn copy_with_idle_reset_survives_past_deadline_while_data_keeps_flowing() {
        let (src, mut src_peer) = tokio::io::duplex(64);
        let (dst, mut dst_peer) = tokio::io::duplex(64);

        let handle = tokio::spawn(copy_with_idle_reset(src, dst, Duration::from_millis(30)));

        // Keep sending data well past the idle deadline; each write resets
        // the deadline, so the overall transfer never times out.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            src_peer.write_all(b"x").await.unwrap();
        }
        drop(src_peer);

        assert!(handle.await.unwrap().is_ok());
        let mut buf = Vec::new();
        dst_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 5);
    }
}
