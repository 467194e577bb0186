//! Logical connection handling shared by relay and agent
//!
//! - [`ConnectionRegistry`]: connection ID -> lifecycle state, with correlation waiters
//! - [`relay()`]: the per-connection byte pump between a local socket and a tunnel
//! - [`spawn_writer`]: frame writer with idle keepalives
//! - [`TunnelStream`]: tunneled connection exposed as `AsyncRead + AsyncWrite`

pub mod error;
pub mod framed;
pub mod keepalive;
pub mod registry;
pub mod relay;
pub mod stream;
pub mod writer;

pub use error::TunnelError;
pub use framed::{framed, read_frame, FramedStream};
pub use keepalive::KeepaliveConfig;
pub use registry::{ConnectionRegistry, ConnectionState, RegistryError};
pub use relay::{relay, DisconnectReason, RelayStats};
pub use stream::{spawn_tunnel_stream, TunnelAddr, TunnelStream};
pub use writer::spawn_writer;
