//! Agent configuration

use crate::error::AgentError;
use quickrelay_connection::KeepaliveConfig;
use quickrelay_transport::ClientTransport;
use std::time::Duration;

/// How to reach the relay and which service to claim there
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Relay address (`host:port`)
    pub relay_addr: String,

    pub service_name: String,

    pub service_token: String,

    /// Plain TCP or TLS
    pub transport: ClientTransport,

    pub keepalive: KeepaliveConfig,

    /// How long the relay may take to answer the handshake
    pub handshake_timeout: Duration,

    /// Bound on dialing the relay and the backend
    pub dial_timeout: Duration,
}

impl RelayOptions {
    pub fn new(
        relay_addr: impl Into<String>,
        service_name: impl Into<String>,
        service_token: impl Into<String>,
    ) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            service_name: service_name.into(),
            service_token: service_token.into(),
            transport: ClientTransport::Plain,
            keepalive: KeepaliveConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_transport(mut self, transport: ClientTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.relay_addr.is_empty() {
            return Err(AgentError::Configuration(
                "relay address is required".to_string(),
            ));
        }
        if self.service_name.is_empty() {
            return Err(AgentError::Configuration(
                "service name is required".to_string(),
            ));
        }
        if self.service_token.is_empty() {
            return Err(AgentError::Configuration(
                "service token is required".to_string(),
            ));
        }
        if !self.keepalive.is_valid() {
            return Err(AgentError::Configuration(format!(
                "keepalive timeout {:?} must exceed interval {:?}",
                self.keepalive.timeout, self.keepalive.interval
            )));
        }
        Ok(())
    }
}

/// Agent that forwards tunneled connections to a backend address
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub relay: RelayOptions,

    /// Backend address (`host:port`)
    pub backend_addr: String,
}

impl AgentConfig {
    pub fn new(relay: RelayOptions, backend_addr: impl Into<String>) -> Self {
        Self {
            relay,
            backend_addr: backend_addr.into(),
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        self.relay.validate()?;
        if self.backend_addr.is_empty() {
            return Err(AgentError::Configuration(
                "backend address is required".to_string(),
            ));
        }
        Ok(())
    }
}
