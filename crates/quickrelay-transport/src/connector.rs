//! Outbound connections from an agent to the relay

use crate::config::ClientTransport;
use crate::{BoxedStream, TransportError, TransportResult};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Dials the relay, optionally wrapping the socket in TLS
#[derive(Clone)]
pub struct Connector {
    tls: Option<(TlsConnector, Option<String>)>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Connector {
    pub fn new(transport: &ClientTransport) -> TransportResult<Self> {
        let tls = match transport {
            ClientTransport::Plain => None,
            ClientTransport::Tls(config) => {
                Some((config.build_tls_connector()?, config.server_name.clone()))
            }
        };
        Ok(Self { tls })
    }

    /// Plain TCP connector
    pub fn plain() -> Self {
        Self { tls: None }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Connect to `address` (`host:port`) within `timeout`, TLS handshake included
    pub async fn connect(&self, address: &str, timeout: Duration) -> TransportResult<BoxedStream> {
        match tokio::time::timeout(timeout, self.connect_inner(address)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(address.to_string())),
        }
    }

    async fn connect_inner(&self, address: &str) -> TransportResult<BoxedStream> {
        let tcp_stream =
            TcpStream::connect(address)
                .await
                .map_err(|e| TransportError::ConnectError {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;
        tcp_stream.set_nodelay(true)?;

        let Some((tls_connector, server_name)) = &self.tls else {
            debug!("TCP connection established to {}", address);
            return Ok(Box::new(tcp_stream));
        };

        let name = match server_name {
            Some(name) => name.clone(),
            None => host_of(address).to_string(),
        };
        let dns_name = ServerName::try_from(name)
            .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

        let tls_stream = tls_connector
            .connect(dns_name, tcp_stream)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        debug!("TLS connection established to {}", address);
        Ok(Box::new(tls_stream))
    }
}

/// Host part of a `host:port` address, without IPv6 brackets
pub fn host_of(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
