//! Development certificate generation using rcgen.
//!
//! Generates a self-signed CA and a server certificate so clients can be
//! pointed at the proxy over TLS during local testing. NOT suitable for
//! production use.

use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use tracing::{debug, info};

use super::error::CertError;

/// Generated certificate bundle (PEM-encoded).
pub struct CertBundle {
    /// CA certificate PEM. Clients trust this.
    pub ca_cert_pem: String,
    /// Server certificate PEM.
    pub server_cert_pem: String,
    /// Server private key PEM.
    pub server_key_pem: String,
}

struct Ca {
    params: CertificateParams,
    key_pair: KeyPair,
    cert_pem: String,
}

fn generate_ca(org_name: &str) -> Result<Ca, CertError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let key_pair = KeyPair::generate().map_err(generation)?;
    let cert = params.self_signed(&key_pair).map_err(generation)?;

    Ok(Ca {
        cert_pem: cert.pem(),
        params,
        key_pair,
    })
}

/// File the dev CA certificate is written to. Clients point their trust
/// store at it.
pub const CA_FILE: &str = "ca.pem";
const SERVER_CERT_FILE: &str = "server.pem";
const SERVER_KEY_FILE: &str = "server-key.pem";

fn generation(e: rcgen::Error) -> CertError {
    CertError::Generation(e.to_string())
}

/// Leaf certificate the proxy presents to clients, valid for every name in
/// `server_names` (IP literals become IP SANs).
fn issue_proxy_cert(ca: &Ca, server_names: &[&str]) -> Result<(String, String), CertError> {
    let names: Vec<String> = server_names.iter().map(|n| (*n).to_owned()).collect();
    let mut params = CertificateParams::new(names).map_err(generation)?;
    params
        .distinguished_name
        .push(DnType::CommonName, "Ferry dev proxy");
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let leaf_key = KeyPair::generate().map_err(generation)?;
    let leaf = params
        .signed_by(&leaf_key, &Issuer::from_params(&ca.params, &ca.key_pair))
        .map_err(generation)?;
    Ok((leaf.pem(), leaf_key.serialize_pem()))
}

/// Generate a throwaway CA and a proxy certificate it signed.
pub fn generate_dev_bundle(server_names: &[&str]) -> Result<CertBundle, CertError> {
    let ca = generate_ca("Ferry Dev")?;
    let (server_cert_pem, server_key_pem) = issue_proxy_cert(&ca, server_names)?;

    Ok(CertBundle {
        ca_cert_pem: ca.cert_pem,
        server_cert_pem,
        server_key_pem,
    })
}

/// Persist `bundle` under `dir`, creating it if needed. Existing files are
/// replaced; every start of a dev-TLS proxy mints a new CA.
pub fn write_dev_certs(dir: &Path, bundle: &CertBundle) -> Result<(), CertError> {
    std::fs::create_dir_all(dir).map_err(|source| CertError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    for (name, pem) in [
        (CA_FILE, &bundle.ca_cert_pem),
        (SERVER_CERT_FILE, &bundle.server_cert_pem),
        (SERVER_KEY_FILE, &bundle.server_key_pem),
    ] {
        let path = dir.join(name);
        std::fs::write(&path, pem).map_err(|source| CertError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "Wrote dev TLS file");
    }

    info!(
        dir = %dir.display(),
        trust = %dir.join(CA_FILE).display(),
        "Dev TLS material ready; clients must trust the CA file"
    );
    Ok(())
}
