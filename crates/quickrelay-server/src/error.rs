use quickrelay_connection::TunnelError;
use quickrelay_transport::TransportError;
use thiserror::Error;

/// Relay server errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to bind {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
