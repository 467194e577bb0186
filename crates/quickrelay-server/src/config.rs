//! Relay server configuration

use quickrelay_connection::KeepaliveConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address agents connect to
    pub listen_addr: SocketAddr,

    /// IP the public service ports are bound on
    pub public_bind_ip: IpAddr,

    /// How long a public client waits for the agent's data connection
    pub correlation_timeout: Duration,

    /// How long a new connection may take to send its first frame
    pub handshake_timeout: Duration,

    pub keepalive: KeepaliveConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4443),
            public_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            correlation_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_public_bind_ip(mut self, ip: IpAddr) -> Self {
        self.public_bind_ip = ip;
        self
    }

    pub fn with_correlation_timeout(mut self, timeout: Duration) -> Self {
        self.correlation_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }
}
