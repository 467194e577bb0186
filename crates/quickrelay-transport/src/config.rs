//! TLS configuration for relay and agent

use crate::{TransportError, TransportResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How an agent reaches the relay
#[derive(Debug, Clone, Default)]
pub enum ClientTransport {
    /// Plain TCP
    #[default]
    Plain,
    /// TLS over TCP
    Tls(ClientTlsConfig),
}

impl ClientTransport {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientTransport::Tls(_))
    }
}

/// Client-side TLS settings
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    /// SNI / verification name; defaults to the host part of the relay address
    pub server_name: Option<String>,

    /// PEM bundle of trusted roots; the webpki roots are used when unset
    pub root_cert_path: Option<PathBuf>,

    /// Disable server certificate verification (INSECURE)
    pub insecure_skip_verify: bool,
}

impl ClientTlsConfig {
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_cert_path = Some(path.into());
        self
    }

    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure_skip_verify = true;
        self
    }

    /// rustls connector for these settings
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let client_crypto = if self.insecure_skip_verify {
            tracing::warn!("TLS certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate {
                    algorithms: provider.signature_verification_algorithms,
                }))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth()
        };

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }

    fn root_store(&self) -> TransportResult<rustls::RootCertStore> {
        let mut roots = rustls::RootCertStore::empty();
        let Some(path) = &self.root_cert_path else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            return Ok(roots);
        };

        let (added, ignored) = roots.add_parsable_certificates(read_certs(path)?);
        if added == 0 {
            return Err(TransportError::ConfigurationError(format!(
                "no usable root certificates in {}",
                path.display()
            )));
        }
        if ignored > 0 {
            tracing::warn!("Ignored {} unparsable root certificates in {}", ignored, path.display());
        }
        Ok(roots)
    }
}

/// Relay-side TLS settings
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl ServerTlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// rustls acceptor serving the configured certificate chain
    pub(crate) fn build_tls_acceptor(&self) -> TransportResult<tokio_rustls::TlsAcceptor> {
        let certs = read_certs(&self.cert_path)?;
        let key = rustls_pemfile::private_key(&mut open_pem(&self.key_path)?)
            .map_err(|e| pem_error(&self.key_path, e))?
            .ok_or_else(|| {
                TransportError::TlsError(format!("no private key in {}", self.key_path.display()))
            })?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_crypto = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("invalid certificate or key: {}", e)))?;

        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

fn open_pem(path: &Path) -> TransportResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TransportError::TlsError(format!("cannot open {}: {}", path.display(), e)))
}

fn pem_error(path: &Path, e: std::io::Error) -> TransportError {
    TransportError::TlsError(format!("cannot parse {}: {}", path.display(), e))
}

fn read_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, e))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Accepts any server certificate, but still checks handshake signatures
/// against the presented key
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
