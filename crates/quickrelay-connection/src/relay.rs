//! Relay loop for one open logical connection
//!
//! Two directions run concurrently:
//! - local -> tunnel: socket reads become data frames
//! - tunnel -> local: data frames are written to the socket, keepalives skipped
//!
//! Whichever side stops first starts the disconnect exchange. Once the local
//! side is done the loop lingers for the peer's `DisconnectResponse`, bounded
//! by the keepalive timeout.

use crate::keepalive::KeepaliveConfig;
use crate::registry::ConnectionRegistry;
use crate::writer::spawn_writer;
use futures::StreamExt;
use quickrelay_proto::{Frame, FrameCodec, FrameType};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Why a relay loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local socket reached end of stream
    LocalClosed,
    /// Peer asked to disconnect
    PeerDisconnected,
    /// Tunnel connection ended without a disconnect exchange
    PeerClosed,
    /// Nothing heard from the peer within the keepalive timeout
    IdleTimeout,
    /// Cancelled through the registry
    Shutdown,
    LocalError(String),
    Tunnel(String),
    PeerError(String),
    /// Peer sent a frame that has no place on a data connection
    Protocol(FrameType),
}

impl DisconnectReason {
    /// Whether the connection ended through a normal close
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            DisconnectReason::LocalClosed
                | DisconnectReason::PeerDisconnected
                | DisconnectReason::Shutdown
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalClosed => write!(f, "local socket closed"),
            DisconnectReason::PeerDisconnected => write!(f, "peer disconnected"),
            DisconnectReason::PeerClosed => write!(f, "tunnel closed by peer"),
            DisconnectReason::IdleTimeout => write!(f, "keepalive timeout"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
            DisconnectReason::LocalError(e) => write!(f, "local socket error: {}", e),
            DisconnectReason::Tunnel(e) => write!(f, "tunnel error: {}", e),
            DisconnectReason::PeerError(e) => write!(f, "peer error: {}", e),
            DisconnectReason::Protocol(t) => write!(f, "unexpected {} frame", t),
        }
    }
}

/// Outcome of a finished relay loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from the local socket and sent through the tunnel
    pub bytes_sent: u64,
    /// Bytes received from the tunnel and written to the local socket
    pub bytes_received: u64,
    pub reason: DisconnectReason,
}

/// Pump bytes between `local` and `tunnel` until either side disconnects
///
/// The connection must already be registered in `registry`; it is removed when
/// the loop ends. Cancelling `shutdown` disconnects the connection.
pub async fn relay<L, S, P>(
    connection_id: &str,
    local: L,
    tunnel: Framed<S, FrameCodec>,
    keepalive: &KeepaliveConfig,
    registry: &ConnectionRegistry<P>,
    shutdown: CancellationToken,
) -> RelayStats
where
    L: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut frames) = tunnel.split();
    let (tx, writer) = spawn_writer(sink, keepalive.interval);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let bytes_sent = AtomicU64::new(0);
    let bytes_received = AtomicU64::new(0);

    debug!(connection_id = %connection_id, "Relay started");

    let reason = {
        // Tunnel -> local
        let inbound = async {
            let reason = loop {
                let frame = match tokio::time::timeout(keepalive.timeout, frames.next()).await {
                    Err(_) => {
                        let _ = tx.try_send(Frame::disconnect_request(connection_id));
                        break DisconnectReason::IdleTimeout;
                    }
                    Ok(None) => break DisconnectReason::PeerClosed,
                    Ok(Some(Err(e))) => break DisconnectReason::Tunnel(e.to_string()),
                    Ok(Some(Ok(frame))) => frame,
                };

                match frame {
                    Frame::Data(payload) if payload.data.is_empty() => {
                        trace!(connection_id = %connection_id, "Keepalive received");
                    }
                    Frame::Data(payload) => {
                        if let Err(e) = local_write.write_all(&payload.data).await {
                            let _ = tx.try_send(Frame::disconnect_request(connection_id));
                            break DisconnectReason::LocalError(e.to_string());
                        }
                        bytes_received.fetch_add(payload.data.len() as u64, Ordering::Relaxed);
                    }
                    Frame::DisconnectRequest(request) => {
                        if request.connection_id != connection_id {
                            debug!(
                                connection_id = %connection_id,
                                requested = %request.connection_id,
                                "Disconnect request names another connection"
                            );
                        }
                        registry.mark_closing(connection_id);
                        let _ = tx.send(Frame::disconnect_response()).await;
                        break DisconnectReason::PeerDisconnected;
                    }
                    Frame::DisconnectResponse(_) => break DisconnectReason::PeerDisconnected,
                    Frame::Error(payload) => break DisconnectReason::PeerError(payload.message),
                    other => break DisconnectReason::Protocol(other.frame_type()),
                }
            };

            let _ = local_write.shutdown().await;
            reason
        };

        // Local -> tunnel
        let outbound = async {
            let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
            let reason = loop {
                let read = tokio::select! {
                    _ = shutdown.cancelled() => break DisconnectReason::Shutdown,
                    read = local_read.read(&mut buffer) => read,
                };

                match read {
                    Ok(0) => break DisconnectReason::LocalClosed,
                    Ok(n) => {
                        if tx.send(Frame::data(buffer[..n].to_vec())).await.is_err() {
                            break DisconnectReason::Tunnel("tunnel writer closed".to_string());
                        }
                        bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => break DisconnectReason::LocalError(e.to_string()),
                }
            };

            registry.mark_closing(connection_id);
            let _ = tx.send(Frame::disconnect_request(connection_id)).await;
            reason
        };

        tokio::pin!(inbound);
        tokio::pin!(outbound);
        let linger = tokio::time::sleep(keepalive.timeout);
        tokio::pin!(linger);
        let mut outbound_reason: Option<DisconnectReason> = None;

        loop {
            tokio::select! {
                reason = &mut inbound => break outbound_reason.take().unwrap_or(reason),
                reason = &mut outbound, if outbound_reason.is_none() => {
                    linger.as_mut().reset(Instant::now() + keepalive.timeout);
                    outbound_reason = Some(reason);
                }
                _ = &mut linger, if outbound_reason.is_some() => {
                    debug!(connection_id = %connection_id, "No disconnect response from peer");
                    break outbound_reason.take().unwrap_or(DisconnectReason::IdleTimeout);
                }
            }
        }
    };

    // Let the writer flush the disconnect exchange, then close the tunnel
    drop(tx);
    let abort = writer.abort_handle();
    if tokio::time::timeout(keepalive.timeout, writer).await.is_err() {
        abort.abort();
    }

    registry.remove(connection_id);

    let stats = RelayStats {
        bytes_sent: bytes_sent.load(Ordering::Relaxed),
        bytes_received: bytes_received.load(Ordering::Relaxed),
        reason,
    };

    debug!(
        connection_id = %connection_id,
        bytes_sent = stats.bytes_sent,
        bytes_received = stats.bytes_received,
        reason = %stats.reason,
        "Relay finished"
    );

    stats
}
