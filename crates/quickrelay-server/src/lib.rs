//! QuickRelay relay server
//!
//! Accepts agent connections on one port. The first frame on each connection
//! decides its role:
//! - `HandshakeRequest`: a control connection; the agent's service is exposed
//!   on its public port for as long as the session lasts
//! - `ConnectResponse`: a data connection answering an earlier `ConnectRequest`
//!
//! Each public client gets its own data connection, correlated by connection ID.

pub mod config;
pub mod error;
pub mod handshake;
pub mod server;
pub mod service;
mod session;

pub use config::RelayConfig;
pub use error::RelayError;
pub use handshake::{authorize, tokens_match};
pub use server::RelayServer;
pub use service::{LookupError, ServiceLookup, ServiceOptions, StaticServices};
