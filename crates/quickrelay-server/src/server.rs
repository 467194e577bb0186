//! Relay server: accept loop and first-frame dispatch

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::service::ServiceLookup;
use crate::session;
use dashmap::DashMap;
use futures::SinkExt;
use quickrelay_connection::{framed, read_frame, ConnectionRegistry, FramedStream, TunnelError};
use quickrelay_proto::Frame;
use quickrelay_transport::Acceptor;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A live agent session, keyed by service name
pub(crate) struct SessionHandle {
    pub id: u64,
    pub public_addr: SocketAddr,
}

pub(crate) struct Inner {
    pub config: RelayConfig,
    pub lookup: Arc<dyn ServiceLookup>,
    pub sessions: DashMap<String, SessionHandle>,
    /// Logical connections; pending entries wait for the agent's data connection
    pub registry: ConnectionRegistry<FramedStream>,
    pub shutdown: CancellationToken,
    pub next_session_id: AtomicU64,
}

/// Relay server
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
    acceptor: Acceptor,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("listen_addr", &self.inner.config.listen_addr)
            .field("sessions", &self.inner.sessions.len())
            .field("connections", &self.inner.registry.len())
            .field("tls", &self.acceptor.is_tls())
            .finish()
    }
}

impl RelayServer {
    pub fn new(config: RelayConfig, lookup: impl ServiceLookup) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                lookup: Arc::new(lookup),
                sessions: DashMap::new(),
                registry: ConnectionRegistry::new(),
                shutdown: CancellationToken::new(),
                next_session_id: AtomicU64::new(1),
            }),
            acceptor: Acceptor::plain(),
        }
    }

    /// Terminate TLS on agent connections
    pub fn with_tls(mut self, acceptor: Acceptor) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Bind the configured listen address and serve until shutdown
    pub async fn serve(&self) -> Result<(), RelayError> {
        let addr = self.inner.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::BindError {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        self.run(listener).await
    }

    /// Serve agent connections from `listener` until shutdown
    pub async fn run(&self, listener: TcpListener) -> Result<(), RelayError> {
        let local_addr = listener.local_addr()?;
        info!(
            "Relay listening on {} ({})",
            local_addr,
            if self.acceptor.is_tls() { "tls" } else { "tcp" }
        );

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    info!("Relay shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let inner = self.inner.clone();
                        let acceptor = self.acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(socket, peer).await {
                                Ok(stream) => handle_connection(inner, framed(stream), peer).await,
                                Err(e) => warn!(peer = %peer, "Rejected connection: {}", e),
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Public address of a connected service
    pub fn public_addr(&self, service_name: &str) -> Option<SocketAddr> {
        self.inner
            .sessions
            .get(service_name)
            .map(|session| session.public_addr)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Pending and open logical connections
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Stop accepting and tear down every session and connection
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn handle_connection(inner: Arc<Inner>, mut conn: FramedStream, peer: SocketAddr) {
    let first = match read_frame(&mut conn, inner.config.handshake_timeout).await {
        Ok(frame) => frame,
        Err(TunnelError::PeerDisconnected) => {
            debug!(peer = %peer, "Connection closed before first frame");
            return;
        }
        Err(e) => {
            warn!(peer = %peer, "Failed to read first frame: {}", e);
            reject(conn, format!("handshake failed: {}", e)).await;
            return;
        }
    };

    match first {
        Frame::HandshakeRequest(request) => session::run(inner, conn, request, peer).await,
        Frame::ConnectResponse(response) => attach(&inner, conn, response.connection_id, peer).await,
        other => {
            warn!(
                peer = %peer,
                frame_type = %other.frame_type(),
                "Unexpected first frame"
            );
            reject(
                conn,
                format!("expected handshake request, got {}", other.frame_type()),
            )
            .await;
        }
    }
}

/// Hand an agent data connection to the public client waiting for it
async fn attach(inner: &Inner, conn: FramedStream, connection_id: String, peer: SocketAddr) {
    match inner.registry.fulfill(&connection_id, conn) {
        Ok(()) => debug!(connection_id = %connection_id, peer = %peer, "Agent connection attached"),
        Err(conn) => {
            warn!(
                connection_id = %connection_id,
                peer = %peer,
                "Connect response for unknown connection"
            );
            reject(conn, format!("unknown connection id: {}", connection_id)).await;
        }
    }
}

/// Send an error frame and close the connection
pub(crate) async fn reject(mut conn: FramedStream, message: String) {
    if conn.send(Frame::error(message)).await.is_ok() {
        let _ = conn.close().await;
    }
}
