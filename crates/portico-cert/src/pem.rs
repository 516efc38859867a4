//! PEM certificate loading

use crate::{CertError, Certificate};
use std::path::Path;
use tracing::info;

/// Load a certificate chain and private key from PEM files
pub fn load_certificate_from_files(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Certificate, CertError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;

    let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Pem(format!("Failed to parse certificate: {}", e)))?;
    if cert_chain.is_empty() {
        return Err(CertError::Pem(format!(
            "No certificate found in {}",
            cert_path.display()
        )));
    }

    let private_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| CertError::Pem(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| CertError::NoPrivateKey(key_path.display().to_string()))?;

    info!(
        "Certificate loaded from {} and {}",
        cert_path.display(),
        key_path.display()
    );

    Ok(Certificate::new(cert_chain, private_key))
}
