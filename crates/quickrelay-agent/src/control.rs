//! Control connection to the relay
//!
//! After the handshake the relay only sends `ConnectRequest`s, keepalives and
//! the occasional disconnect on this connection. Every `ConnectRequest` is
//! handed to a [`ConnectHandler`] in its own task.

use crate::config::RelayOptions;
use crate::error::AgentError;
use crate::handshake::handshake;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use quickrelay_connection::{framed, spawn_writer, ConnectionRegistry, FramedStream, TunnelError};
use quickrelay_proto::Frame;
use quickrelay_transport::Connector;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// What the agent does with a new logical connection
#[async_trait]
pub trait ConnectHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: ConnectContext) -> Result<(), AgentError>;
}

/// Everything a handler needs to serve one connection request
pub struct ConnectContext {
    pub connection_id: String,
    pub options: Arc<RelayOptions>,
    pub registry: ConnectionRegistry<()>,
    /// Cancelled when the connection should be torn down
    pub shutdown: CancellationToken,
    connector: Connector,
    control: mpsc::WeakSender<Frame>,
}

impl ConnectContext {
    /// Dial the relay and announce this connection on the new physical connection
    ///
    /// The connection is registered as open; the relay loop removes it again.
    pub async fn open_data_connection(&self) -> Result<FramedStream, AgentError> {
        self.registry
            .register_open(&self.connection_id, self.shutdown.clone())
            .map_err(TunnelError::from)?;

        match self.dial().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.registry.remove(&self.connection_id);
                Err(e)
            }
        }
    }

    async fn dial(&self) -> Result<FramedStream, AgentError> {
        let stream = self
            .connector
            .connect(&self.options.relay_addr, self.options.dial_timeout)
            .await?;
        let mut conn = framed(stream);
        conn.send(Frame::connect_response(self.connection_id.as_str()))
            .await?;
        Ok(conn)
    }

    /// Tell the relay this connection failed
    pub async fn report_error(&self, message: impl Into<String>) {
        if let Some(control) = self.control.upgrade() {
            let _ = control.send(Frame::error(message)).await;
        }
    }
}

/// An authenticated control connection
pub struct ControlSession {
    conn: FramedStream,
    options: Arc<RelayOptions>,
    connector: Connector,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("relay", &self.options.relay_addr)
            .field("service", &self.options.service_name)
            .finish()
    }
}

impl ControlSession {
    /// Dial the relay and complete the handshake
    pub async fn connect(options: Arc<RelayOptions>) -> Result<Self, AgentError> {
        options.validate()?;

        let connector = Connector::new(&options.transport)?;
        let stream = connector
            .connect(&options.relay_addr, options.dial_timeout)
            .await?;
        let mut conn = framed(stream);

        handshake(&mut conn, &options).await?;

        info!(
            service = %options.service_name,
            relay = %options.relay_addr,
            "Connected to relay"
        );

        Ok(Self {
            conn,
            options,
            connector,
        })
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Serve connection requests until the control connection ends or `shutdown` fires
    ///
    /// Every connection started by this session is cancelled when it ends.
    pub async fn serve<H: ConnectHandler>(
        self,
        handler: Arc<H>,
        registry: ConnectionRegistry<()>,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        let keepalive = self.options.keepalive;
        let session_shutdown = shutdown.child_token();

        let (sink, mut frames) = self.conn.split();
        let (control, writer) = spawn_writer(sink, keepalive.interval);

        let idle = tokio::time::sleep(keepalive.timeout);
        tokio::pin!(idle);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = &mut idle => {
                    break Err(TunnelError::Transport("relay keepalive timeout".to_string()));
                }
                frame = frames.next() => {
                    idle.as_mut().reset(Instant::now() + keepalive.timeout);
                    let frame = match frame {
                        None => break Err(TunnelError::PeerDisconnected),
                        Some(Err(e)) => break Err(e.into()),
                        Some(Ok(frame)) => frame,
                    };

                    match frame {
                        Frame::ConnectRequest(request) => {
                            debug!(connection_id = %request.connection_id, "Connect request");
                            let ctx = ConnectContext {
                                connection_id: request.connection_id,
                                options: self.options.clone(),
                                registry: registry.clone(),
                                shutdown: session_shutdown.child_token(),
                                connector: self.connector.clone(),
                                control: control.downgrade(),
                            };
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                let connection_id = ctx.connection_id.clone();
                                if let Err(e) = handler.handle(ctx).await {
                                    warn!(connection_id = %connection_id, "Connection failed: {}", e);
                                }
                            });
                        }
                        Frame::Data(payload) if payload.data.is_empty() => {
                            trace!("Keepalive received");
                        }
                        Frame::DisconnectRequest(request) => {
                            if registry.disconnect(&request.connection_id) {
                                let _ = control.send(Frame::disconnect_response()).await;
                            } else {
                                debug!(
                                    connection_id = %request.connection_id,
                                    "Ignoring disconnect request for unknown connection"
                                );
                            }
                        }
                        Frame::DisconnectResponse(_) => {}
                        Frame::Error(payload) => {
                            break Err(TunnelError::Protocol(format!("relay error: {}", payload.message)));
                        }
                        other => {
                            break Err(TunnelError::Protocol(format!(
                                "unexpected {} frame on control connection",
                                other.frame_type()
                            )));
                        }
                    }
                }
            }
        };

        session_shutdown.cancel();
        drop(control);
        let _ = tokio::time::timeout(keepalive.timeout, writer).await;

        match &result {
            Ok(()) => info!(service = %self.options.service_name, "Control connection closed"),
            Err(e) => warn!(service = %self.options.service_name, "Control connection lost: {}", e),
        }

        result.map_err(AgentError::from)
    }
}
