//! Turning configuration into rustls acceptors and connectors.

use std::path::PathBuf;
use std::sync::Arc;

use ferry_core::config::{ClientTlsConfig, RemoteTlsConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

use super::certs::{generate_dev_bundle, write_dev_certs};
use super::error::TlsError;
use super::{load_certificates, load_private_key, parse_certificates, parse_private_key};

/// TLS presented to connecting clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTlsMode {
    /// No TLS (plaintext).
    Disabled,
    /// Auto-generated self-signed certificates for development.
    DevSelfSigned {
        /// Directory to store generated certs.
        cert_dir: PathBuf,
    },
    /// User-provided certificate and key files.
    Custom {
        /// Path to PEM-encoded certificate file.
        cert_path: PathBuf,
        /// Path to PEM-encoded private key file.
        key_path: PathBuf,
    },
}

impl ClientTlsMode {
    pub fn from_config(config: &ClientTlsConfig) -> Self {
        match config {
            ClientTlsConfig::Disabled => Self::Disabled,
            ClientTlsConfig::DevSelfSigned { cert_dir } => Self::DevSelfSigned {
                cert_dir: cert_dir.clone().unwrap_or_else(default_cert_dir),
            },
            ClientTlsConfig::Custom {
                cert_path,
                key_path,
            } => Self::Custom {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            },
        }
    }

    /// Build the acceptor for this mode.
    ///
    /// Returns `None` if TLS is disabled.
    pub fn build_acceptor(&self) -> Result<Option<TlsAcceptor>, TlsError> {
        let (certs, key) = match self {
            Self::Disabled => return Ok(None),
            Self::DevSelfSigned { cert_dir } => {
                info!("Generating dev TLS certificates");
                let bundle = generate_dev_bundle(&["localhost", "127.0.0.1"])?;
                write_dev_certs(cert_dir, &bundle)?;
                info!(cert_dir = %cert_dir.display(), "Dev TLS enabled");
                (
                    parse_certificates(&bundle.server_cert_pem)?,
                    parse_private_key(&bundle.server_key_pem)?,
                )
            }
            Self::Custom {
                cert_path,
                key_path,
            } => {
                let certs = load_certificates(cert_path)?;
                let key = load_private_key(key_path)?;
                info!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    "Custom TLS enabled"
                );
                (certs, key)
            }
        };

        Ok(Some(acceptor_from_parts(certs, key)?))
    }
}

/// Build a server-side acceptor from a certificate chain and key.
pub fn acceptor_from_parts(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor, TlsError> {
    let provider = rustls::crypto::ring::default_provider();
    let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::config(format!("Failed to build TLS config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn default_cert_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ferry")
        .join("certs")
}

/// TLS towards the remote endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTls {
    /// PEM trust anchors; `None` uses the bundled webpki roots.
    pub ca_path: Option<PathBuf>,
    /// Accept any certificate the remote presents.
    pub insecure: bool,
}

impl RemoteTls {
    /// `None` when the config leaves the remote leg in plaintext.
    pub fn from_config(config: &RemoteTlsConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            ca_path: config.ca_path.clone(),
            insecure: config.insecure,
        })
    }

    pub fn build_connector(&self) -> Result<TlsConnector, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {e}")))?;

        let client_config = if self.insecure {
            warn!("Remote TLS certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth()
        };

        Ok(TlsConnector::from(Arc::new(client_config)))
    }

    fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let Some(ca_path) = &self.ca_path else {
            return Ok(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            });
        };

        let mut roots = RootCertStore::empty();
        for cert in load_certificates(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::cert_load(ca_path, e.to_string()))?;
        }
        Ok(roots)
    }
}

/// Parse the SNI name for a remote host (DNS name or IP literal).
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::config(format!("Invalid server name: {host}")))
}

/// Verifier that accepts every certificate. Testing only.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
