//! Tunneled connection as an ordinary async byte stream
//!
//! A [`TunnelStream`] is one end of an in-memory duplex pipe; the other end is
//! driven by [`relay()`](crate::relay()) against the connection's physical
//! tunnel. Reads and writes map onto data frames, and shutting the stream down
//! (or dropping it) starts the disconnect exchange.

use crate::keepalive::KeepaliveConfig;
use crate::registry::ConnectionRegistry;
use crate::relay::relay;
use quickrelay_proto::FrameCodec;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes buffered between a tunnel stream and its relay loop
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Address of a tunneled endpoint: a service exposed through a relay
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelAddr {
    pub relay: String,
    pub service: String,
}

impl TunnelAddr {
    pub fn new(relay: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.relay)
    }
}

/// One logical connection, readable and writable like a socket
pub struct TunnelStream {
    inner: DuplexStream,
    connection_id: String,
    addr: TunnelAddr,
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("connection_id", &self.connection_id)
            .field("addr", &self.addr)
            .finish()
    }
}

impl TunnelStream {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The service this connection was accepted for
    pub fn local_addr(&self) -> &TunnelAddr {
        &self.addr
    }

    /// The relay the connection runs through
    pub fn peer_addr(&self) -> &str {
        &self.addr.relay
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Start relaying `tunnel` and return the application end as a stream
///
/// The connection must already be registered in `registry` with `shutdown`.
pub fn spawn_tunnel_stream<S, P>(
    connection_id: String,
    addr: TunnelAddr,
    tunnel: Framed<S, FrameCodec>,
    keepalive: KeepaliveConfig,
    registry: ConnectionRegistry<P>,
    shutdown: CancellationToken,
) -> TunnelStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    P: Send + 'static,
{
    let (inner, relay_end) = tokio::io::duplex(STREAM_BUFFER_SIZE);

    let id = connection_id.clone();
    tokio::spawn(async move {
        let stats = relay(&id, relay_end, tunnel, &keepalive, &registry, shutdown).await;
        debug!(
            connection_id = %id,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            reason = %stats.reason,
            "Tunnel stream closed"
        );
    });

    TunnelStream {
        inner,
        connection_id,
        addr,
    }
}
