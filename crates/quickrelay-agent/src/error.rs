use quickrelay_connection::TunnelError;
use quickrelay_proto::CodecError;
use quickrelay_transport::TransportError;
use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to connect to backend {address}: {reason}")]
    BackendUnavailable { address: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AgentError {
    /// The relay refused the handshake; retrying with the same credentials won't help
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            AgentError::Tunnel(TunnelError::AuthenticationFailure(_))
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, AgentError::Tunnel(TunnelError::Closed))
    }
}

impl From<CodecError> for AgentError {
    fn from(err: CodecError) -> Self {
        AgentError::Tunnel(err.into())
    }
}
