//! Tunnel listener
//!
//! Exposes a service on the relay and yields each tunneled connection as a
//! [`TunnelStream`], the way a `TcpListener` yields sockets.

use crate::config::RelayOptions;
use crate::control::{ConnectContext, ConnectHandler, ControlSession};
use crate::error::AgentError;
use async_trait::async_trait;
use quickrelay_connection::{
    spawn_tunnel_stream, ConnectionRegistry, TunnelAddr, TunnelError, TunnelStream,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connections accepted by the relay but not yet claimed by `accept`
const ACCEPT_BACKLOG: usize = 128;

pub struct TunnelListener {
    addr: TunnelAddr,
    incoming: Mutex<mpsc::Receiver<TunnelStream>>,
    registry: ConnectionRegistry<()>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TunnelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelListener")
            .field("addr", &self.addr)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl TunnelListener {
    /// Connect to the relay and start accepting connections for the service
    pub async fn bind(options: RelayOptions) -> Result<Self, AgentError> {
        let addr = TunnelAddr::new(options.relay_addr.as_str(), options.service_name.as_str());
        let session = ControlSession::connect(Arc::new(options)).await?;

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let registry = ConnectionRegistry::new();
        let shutdown = CancellationToken::new();

        let handler = Arc::new(StreamHandler {
            addr: addr.clone(),
            incoming: tx,
        });

        tokio::spawn({
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = session.serve(handler, registry, shutdown.clone()).await {
                    debug!("Listener control session ended: {}", e);
                }
                shutdown.cancel();
            }
        });

        info!(addr = %addr, "Tunnel listener bound");

        Ok(Self {
            addr,
            incoming: Mutex::new(rx),
            registry,
            shutdown,
        })
    }

    /// Wait for the next tunneled connection
    ///
    /// Fails with [`TunnelError::Closed`] once the listener is closed or the
    /// control connection is gone.
    pub async fn accept(&self) -> Result<TunnelStream, AgentError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::Closed.into()),
            stream = incoming.recv() => stream.ok_or_else(|| TunnelError::Closed.into()),
        }
    }

    pub fn local_addr(&self) -> &TunnelAddr {
        &self.addr
    }

    /// Open connections that came through this listener
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close the listener, failing pending accepts and disconnecting open connections
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(addr = %self.addr, "Closing tunnel listener");
        }
        self.shutdown.cancel();
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct StreamHandler {
    addr: TunnelAddr,
    incoming: mpsc::Sender<TunnelStream>,
}

#[async_trait]
impl ConnectHandler for StreamHandler {
    async fn handle(&self, ctx: ConnectContext) -> Result<(), AgentError> {
        let tunnel = ctx.open_data_connection().await?;

        let stream = spawn_tunnel_stream(
            ctx.connection_id.clone(),
            self.addr.clone(),
            tunnel,
            ctx.options.keepalive,
            ctx.registry.clone(),
            ctx.shutdown.clone(),
        );

        // A dropped stream disconnects itself
        if self.incoming.send(stream).await.is_err() {
            warn!(connection_id = %ctx.connection_id, "Listener closed, dropping connection");
        }
        Ok(())
    }
}
