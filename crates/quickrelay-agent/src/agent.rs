//! Agent that forwards tunneled connections to a fixed backend

use crate::config::AgentConfig;
use crate::control::{ConnectContext, ConnectHandler, ControlSession};
use crate::error::AgentError;
use async_trait::async_trait;
use quickrelay_connection::{relay, ConnectionRegistry};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Agent {
    config: AgentConfig,
    registry: ConnectionRegistry<()>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("relay", &self.config.relay.relay_addr)
            .field("service", &self.config.relay.service_name)
            .field("backend", &self.config.backend_addr)
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Dial the relay and authenticate
    pub async fn connect(&self) -> Result<ControlSession, AgentError> {
        self.config.validate()?;
        ControlSession::connect(Arc::new(self.config.relay.clone())).await
    }

    /// Forward connection requests from an established session until it ends
    pub async fn serve(&self, session: ControlSession) -> Result<(), AgentError> {
        let handler = Arc::new(BackendForwarder {
            backend_addr: self.config.backend_addr.clone(),
        });
        session
            .serve(handler, self.registry.clone(), self.shutdown.clone())
            .await
    }

    /// Connect and serve; returns when the control connection ends
    pub async fn run(&self) -> Result<(), AgentError> {
        let session = self.connect().await?;
        self.serve(session).await
    }

    /// Stop serving and disconnect every open connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }
}

struct BackendForwarder {
    backend_addr: String,
}

#[async_trait]
impl ConnectHandler for BackendForwarder {
    async fn handle(&self, ctx: ConnectContext) -> Result<(), AgentError> {
        let dial = tokio::time::timeout(
            ctx.options.dial_timeout,
            TcpStream::connect(&self.backend_addr),
        )
        .await;

        let backend = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.backend_failed(&ctx, e.to_string()).await),
            Err(_) => return Err(self.backend_failed(&ctx, "timed out".to_string()).await),
        };
        let _ = backend.set_nodelay(true);

        debug!(
            connection_id = %ctx.connection_id,
            backend = %self.backend_addr,
            "Connected to backend"
        );

        let tunnel = ctx.open_data_connection().await?;

        let stats = relay(
            &ctx.connection_id,
            backend,
            tunnel,
            &ctx.options.keepalive,
            &ctx.registry,
            ctx.shutdown.clone(),
        )
        .await;

        info!(
            connection_id = %ctx.connection_id,
            bytes_to_backend = stats.bytes_received,
            bytes_from_backend = stats.bytes_sent,
            reason = %stats.reason,
            "Connection closed"
        );

        Ok(())
    }
}

impl BackendForwarder {
    async fn backend_failed(&self, ctx: &ConnectContext, reason: String) -> AgentError {
        ctx.report_error(format!(
            "connection {}: backend {} unavailable: {}",
            ctx.connection_id, self.backend_addr, reason
        ))
        .await;

        AgentError::BackendUnavailable {
            address: self.backend_addr.clone(),
            reason,
        }
    }
}
