//! Inbound connections on the relay's control port

use crate::config::ServerTlsConfig;
use crate::{BoxedStream, TransportError, TransportResult};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// Upgrades accepted sockets to TLS when the relay has a certificate
#[derive(Clone, Default)]
pub struct Acceptor {
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl Acceptor {
    /// Plain TCP acceptor
    pub fn plain() -> Self {
        Self { tls_acceptor: None }
    }

    /// TLS acceptor from PEM cert and key files
    pub fn tls(config: &ServerTlsConfig) -> TransportResult<Self> {
        Ok(Self {
            tls_acceptor: Some(config.build_tls_acceptor()?),
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Finish setting up an accepted socket
    pub async fn accept(
        &self,
        tcp_stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> TransportResult<BoxedStream> {
        tcp_stream.set_nodelay(true)?;

        let Some(tls_acceptor) = &self.tls_acceptor else {
            return Ok(Box::new(tcp_stream));
        };

        let tls_stream = tls_acceptor.accept(tcp_stream).await.map_err(|e| {
            TransportError::TlsError(format!("TLS handshake failed from {}: {}", remote_addr, e))
        })?;

        debug!("TLS handshake complete from {}", remote_addr);
        Ok(Box::new(tls_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_accept_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = Acceptor::plain();
        assert!(!acceptor.is_tls());

        let server = tokio::spawn(async move {
            let (socket, remote) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(socket, remote).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = Connector::plain()
            .connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }
}
