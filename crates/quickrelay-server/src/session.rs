//! Agent sessions
//!
//! A session owns the control connection and the public listener of one
//! service. Each accepted public client is correlated with a fresh agent data
//! connection and then relayed. Ending the session cancels its token, which
//! tears down every pending and open connection it created.

use crate::handshake::authorize;
use crate::server::{reject, Inner, SessionHandle};
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use quickrelay_connection::{relay, spawn_writer, FramedStream, TunnelError};
use quickrelay_proto::{Frame, HandshakeRequest};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub(crate) async fn run(
    inner: Arc<Inner>,
    mut conn: FramedStream,
    request: HandshakeRequest,
    peer: SocketAddr,
) {
    let service = request.service_name.clone();

    let options = match authorize(&request, inner.lookup.as_ref()) {
        Ok(options) => options,
        Err(e) => {
            warn!(service = %service, peer = %peer, "Handshake rejected: {}", e);
            reject(conn, e.to_string()).await;
            return;
        }
    };

    if inner.sessions.contains_key(&service) {
        warn!(service = %service, peer = %peer, "Handshake rejected: service already connected");
        reject(conn, format!("service {} already has an agent", service)).await;
        return;
    }

    let bind_addr = SocketAddr::new(inner.config.public_bind_ip, options.service_port);
    let public = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(service = %service, peer = %peer, "Handshake rejected: cannot bind {}: {}", bind_addr, e);
            reject(conn, format!("cannot expose service on {}: {}", bind_addr, e)).await;
            return;
        }
    };
    let public_addr = match public.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(service = %service, peer = %peer, "Handshake rejected: {}", e);
            reject(conn, format!("cannot expose service: {}", e)).await;
            return;
        }
    };

    let session_id = inner.next_session_id.fetch_add(1, Ordering::Relaxed);
    match inner.sessions.entry(service.clone()) {
        Entry::Occupied(_) => {
            warn!(service = %service, peer = %peer, "Handshake rejected: service already connected");
            reject(conn, format!("service {} already has an agent", service)).await;
            return;
        }
        Entry::Vacant(vacant) => {
            vacant.insert(SessionHandle {
                id: session_id,
                public_addr,
            });
        }
    }

    if let Err(e) = conn.send(Frame::handshake_response()).await {
        debug!(service = %service, "Failed to send handshake response: {}", e);
        inner.sessions.remove_if(&service, |_, s| s.id == session_id);
        return;
    }

    info!(
        service = %service,
        peer = %peer,
        public_addr = %public_addr,
        "Session established"
    );

    let session = Session {
        shutdown: inner.shutdown.child_token(),
        inner,
        service,
        session_id,
    };
    session.serve(conn, public).await;
}

struct Session {
    inner: Arc<Inner>,
    service: String,
    session_id: u64,
    shutdown: CancellationToken,
}

impl Session {
    async fn serve(self, conn: FramedStream, public: TcpListener) {
        let keepalive = self.inner.config.keepalive;
        let (sink, mut frames) = conn.split();
        let (control, writer) = spawn_writer(sink, keepalive.interval);

        let idle = tokio::time::sleep(keepalive.timeout);
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break "shutdown".to_string(),
                _ = &mut idle => break "keepalive timeout".to_string(),
                accepted = public.accept() => match accepted {
                    Ok((socket, client)) => {
                        tokio::spawn(correlate(
                            self.inner.clone(),
                            self.session_id,
                            control.clone(),
                            socket,
                            client,
                            self.service.clone(),
                            self.shutdown.child_token(),
                        ));
                    }
                    Err(e) => error!(service = %self.service, "Failed to accept public connection: {}", e),
                },
                frame = frames.next() => {
                    idle.as_mut().reset(Instant::now() + keepalive.timeout);
                    match frame {
                        None => break "control connection closed".to_string(),
                        Some(Err(e)) => break TunnelError::from(e).to_string(),
                        Some(Ok(frame)) => {
                            if let Err(reason) = self.handle_control_frame(frame, &control).await {
                                break reason;
                            }
                        }
                    }
                }
            }
        };

        self.shutdown.cancel();
        self.inner
            .sessions
            .remove_if(&self.service, |_, s| s.id == self.session_id);

        drop(control);
        let _ = tokio::time::timeout(keepalive.timeout, writer).await;

        info!(service = %self.service, reason = %reason, "Session closed");
    }

    async fn handle_control_frame(
        &self,
        frame: Frame,
        control: &mpsc::Sender<Frame>,
    ) -> Result<(), String> {
        match frame {
            Frame::Data(payload) if payload.data.is_empty() => {
                trace!(service = %self.service, "Keepalive received");
            }
            Frame::DisconnectRequest(request) => {
                if self
                    .inner
                    .registry
                    .disconnect_owned(self.session_id, &request.connection_id)
                {
                    debug!(
                        service = %self.service,
                        connection_id = %request.connection_id,
                        "Disconnect requested on control connection"
                    );
                    let _ = control.send(Frame::disconnect_response()).await;
                } else {
                    debug!(
                        service = %self.service,
                        connection_id = %request.connection_id,
                        "Ignoring disconnect request for connection not owned by this session"
                    );
                }
            }
            Frame::DisconnectResponse(_) => {}
            Frame::Error(payload) => {
                // Agent-side failure of one connection; its pending entry times out
                warn!(service = %self.service, "Agent reported error: {}", payload.message);
            }
            other => {
                warn!(
                    service = %self.service,
                    frame_type = %other.frame_type(),
                    "Unexpected frame on control connection"
                );
                let _ = control
                    .send(Frame::error(format!(
                        "unexpected {} frame on control connection",
                        other.frame_type()
                    )))
                    .await;
                return Err(format!("unexpected {} frame", other.frame_type()));
            }
        }
        Ok(())
    }
}

/// Ask the agent for a data connection and relay the public client over it
async fn correlate(
    inner: Arc<Inner>,
    session_id: u64,
    control: mpsc::Sender<Frame>,
    socket: TcpStream,
    client: SocketAddr,
    service: String,
    shutdown: CancellationToken,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();

    let registered = inner
        .registry
        .register_pending_owned(session_id, &connection_id, shutdown.clone());
    let mut waiter = match registered {
        Ok(waiter) => waiter,
        Err(e) => {
            error!(service = %service, client = %client, "Rejecting public connection: {}", e);
            return;
        }
    };

    if control
        .send(Frame::connect_request(connection_id.as_str()))
        .await
        .is_err()
    {
        inner.registry.remove(&connection_id);
        return;
    }
    drop(control);

    debug!(
        service = %service,
        connection_id = %connection_id,
        client = %client,
        "Connect request sent"
    );

    let tunnel = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = tokio::time::timeout(inner.config.correlation_timeout, &mut waiter) => {
            result.ok().and_then(|r| r.ok())
        }
    };

    let Some(tunnel) = tunnel else {
        // Remove first so a late fulfill either lands in the waiter or fails
        inner.registry.remove(&connection_id);
        waiter.close();
        if let Ok(late) = waiter.try_recv() {
            reject(late, format!("connection {} timed out", connection_id)).await;
        }

        if !shutdown.is_cancelled() {
            info!(
                service = %service,
                client = %client,
                "{}",
                TunnelError::CorrelationTimeout(connection_id)
            );
        }
        return;
    };

    info!(
        service = %service,
        connection_id = %connection_id,
        client = %client,
        "Connection opened"
    );

    let stats = relay(
        &connection_id,
        socket,
        tunnel,
        &inner.config.keepalive,
        &inner.registry,
        shutdown,
    )
    .await;

    info!(
        service = %service,
        connection_id = %connection_id,
        bytes_in = stats.bytes_sent,
        bytes_out = stats.bytes_received,
        reason = %stats.reason,
        "Connection closed"
    );
}
