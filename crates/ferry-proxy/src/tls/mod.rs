//! TLS transport for the proxy.
//!
//! ```text
//! ┌──────────┐   TLS (server-side)   ┌───────┐   TLS (client-side)   ┌──────────┐
//! │  Client  │ ───────────────────── │ Ferry │ ───────────────────── │  Remote  │
//! └──────────┘                       └───────┘                       └──────────┘
//! ```
//!
//! Either leg is optional. Terminating TLS on both legs gives the observer
//! hooks the plaintext of an otherwise encrypted conversation.

pub mod certs;
pub mod config;
pub mod error;

pub use certs::{CA_FILE, CertBundle, generate_dev_bundle, write_dev_certs};
pub use config::{ClientTlsMode, RemoteTls};
pub use error::{CertError, TlsError};

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Load every certificate from a PEM file (chains allowed).
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::cert_load(path, "no certificates found in file"));
    }
    Ok(certs)
}

/// Load the first private key (RSA, PKCS8 or EC) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::config(format!("Invalid certificate PEM: {e}")))
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TlsError::config(format!("Invalid private key PEM: {e}")))?
        .ok_or_else(|| TlsError::config("no private key found in PEM"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_files_fails() {
        let err = load_certificates(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, TlsError::CertificateLoad { .. }));

        let err = load_private_key(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(matches!(err, TlsError::PrivateKeyLoad { .. }));
    }

    #[test]
    fn load_written_dev_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = generate_dev_bundle(&["localhost"]).unwrap();
        write_dev_certs(dir.path(), &bundle).unwrap();

        assert_eq!(load_certificates(&dir.path().join("server.pem")).unwrap().len(), 1);
        load_private_key(&dir.path().join("server-key.pem")).unwrap();
    }

    #[test]
    fn file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a pem\n").unwrap();

        let err = load_certificates(&path).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }
}
