//! Error taxonomy for tunnel operations

use crate::registry::RegistryError;
use quickrelay_proto::CodecError;
use quickrelay_transport::TransportError;
use thiserror::Error;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Decode or validation failure; fatal to the physical connection
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Bad token or unknown service; fatal to the control connection
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// No agent connection arrived for a pending connection in time
    #[error("Timed out waiting for connection {0}")]
    CorrelationTimeout(String),

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection id already registered: {0}")]
    RegistryConflict(String),

    #[error("Closed")]
    Closed,

    /// Well-formed frame arriving where the protocol does not allow it
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TunnelError {
    /// Whether the error ends the session rather than a single logical connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::MalformedFrame(_)
                | TunnelError::AuthenticationFailure(_)
                | TunnelError::Protocol(_)
        )
    }
}

impl From<CodecError> for TunnelError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => TunnelError::Transport(e.to_string()),
            other => TunnelError::MalformedFrame(other.to_string()),
        }
    }
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        TunnelError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::Transport(err.to_string())
    }
}

impl From<RegistryError> for TunnelError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Conflict(id) => TunnelError::RegistryConflict(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickrelay_proto::FrameError;

    #[test]
    fn test_codec_error_mapping() {
        let err: TunnelError = CodecError::Malformed("eof".to_string()).into();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));

        let err: TunnelError = CodecError::Invalid(FrameError::UnknownFrameType(99)).into();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
        assert!(err.is_fatal());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: TunnelError = CodecError::Io(io).into();
        assert!(matches!(err, TunnelError::Transport(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_registry_conflict_mapping() {
        let err: TunnelError = RegistryError::Conflict("abc".to_string()).into();
        assert!(matches!(err, TunnelError::RegistryConflict(ref id) if id == "abc"));
    }
}
