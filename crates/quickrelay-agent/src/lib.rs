//! QuickRelay agent
//!
//! Runs behind NAT next to a private service and keeps one outbound control
//! connection to the relay. For every `ConnectRequest` it opens a new data
//! connection back to the relay and either forwards it to a backend
//! ([`Agent`]) or hands it to application code ([`TunnelListener`]).

pub mod agent;
pub mod config;
pub mod control;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod reconnect;

pub use agent::Agent;
pub use config::{AgentConfig, RelayOptions};
pub use control::{ConnectContext, ConnectHandler, ControlSession};
pub use error::AgentError;
pub use listener::TunnelListener;
pub use reconnect::Backoff;

pub use quickrelay_connection::{TunnelAddr, TunnelStream};
