//! TLS listener configuration: TLS 1.2 only, a single trust anchor, and
//! mandatory client certificates.
//!
//! The verifier here only anchors the chain; the engine re-validates it
//! with the current revocation snapshot and projects the policy before a
//! session does anything.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::{Error, Result};

/// Load all PEM certificates from a file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Load the first PEM private key from a file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Config(format!("{}: no private key found", path.display())))
}

/// Load the trust anchor. Exactly one CA certificate is accepted.
pub fn load_ca(path: &Path) -> Result<CertificateDer<'static>> {
    let mut certs = load_certs(path)?;
    if certs.len() != 1 {
        return Err(Error::Config(format!(
            "{}: expected exactly one CA certificate, found {}",
            path.display(),
            certs.len()
        )));
    }
    Ok(certs.remove(0))
}

/// Build the server configuration: TLS 1.2 only, client auth anchored at
/// `ca`.
pub fn server_config(
    ca: &CertificateDer<'static>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(ca.clone())
        .map_err(|e| Error::Config(format!("trust anchor rejected: {}", e)))?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Config(format!("client verifier: {}", e)))?;
    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(config)
}
