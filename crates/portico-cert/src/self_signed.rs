//! Self-signed certificates for development and unconfigured hostnames

use crate::{CertError, Certificate};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

/// Generate a self-signed certificate covering `domains`
pub fn generate_self_signed_cert(domains: &[String]) -> Result<Certificate, CertError> {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(domains.to_vec())?;
    debug!("Generated self-signed certificate for {:?}", domains);

    Ok(Certificate::new(
        vec![cert.der().clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
    ))
}
