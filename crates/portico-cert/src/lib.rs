//! Certificate resolution for the relay
//!
//! The relay never issues certificates itself. It asks a [`CertificateProvider`]
//! for a certificate by SNI name, both when terminating TLS for the local HTTPS
//! stack and when re-encrypting a tunnel. Providers here cover static PEM files
//! and on-demand self-signed certificates; ACME-backed providers plug in through
//! the same trait.

pub mod pem;
pub mod provider;
pub mod self_signed;
pub mod verify;

pub use pem::load_certificate_from_files;
pub use provider::{
    server_config, CertificateProvider, ProviderResolver, SelfSignedProvider,
    StaticCertificateProvider,
};
pub use self_signed::generate_self_signed_cert;
pub use verify::{backend_client_config, AcceptAnyServerCert, BackendVerification};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use thiserror::Error;

/// Certificate errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse PEM: {0}")]
    Pem(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Unsupported private key: {0}")]
    InvalidKey(rustls::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate generation error: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("No certificate available for {0}")]
    NoCertificate(String),
}

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Convert into the signing form rustls hands out during handshakes
    pub fn into_certified_key(self) -> Result<Arc<CertifiedKey>, CertError> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.private_key)
            .map_err(CertError::InvalidKey)?;
        Ok(Arc::new(CertifiedKey::new(self.cert_chain, signing_key)))
    }
}
