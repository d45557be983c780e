//! TLS-specific error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or using a TLS acceptor/connector.
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to load certificate from {path}: {reason}")]
    CertificateLoad { path: PathBuf, reason: String },

    #[error("Failed to load private key from {path}: {reason}")]
    PrivateKeyLoad { path: PathBuf, reason: String },

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Cert(#[from] CertError),
}

impl TlsError {
    pub fn cert_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CertificateLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn key_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PrivateKeyLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }
}

impl From<TlsError> for std::io::Error {
    fn from(e: TlsError) -> Self {
        Self::other(e)
    }
}

/// Certificate generation errors.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
