//! Byte-stream transport for QuickRelay
//!
//! Control and data connections are plain TCP or TLS over TCP. Both are handed
//! to the rest of the system as a [`BoxedStream`], so framing and relaying code
//! never needs to know which one it got.

pub mod config;
pub mod connector;
pub mod listener;

pub use config::{ClientTlsConfig, ClientTransport, ServerTlsConfig};
pub use connector::Connector;
pub use listener::Acceptor;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {reason}")]
    ConnectError { address: String, reason: String },

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Any bidirectional byte stream a connection can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased transport stream
pub type BoxedStream = Box<dyn AsyncStream>;
