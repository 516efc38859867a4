//! Certificate providers and the rustls resolver adapter

use crate::self_signed::generate_self_signed_cert;
use crate::{CertError, Certificate};
use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Get a certificate for an SNI name
pub trait CertificateProvider: Send + Sync + fmt::Debug {
    fn certificate_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertError>;
}

/// Serves one certificate for every name
pub struct StaticCertificateProvider {
    key: Arc<CertifiedKey>,
}

impl StaticCertificateProvider {
    pub fn new(certificate: Certificate) -> Result<Self, CertError> {
        Ok(Self {
            key: certificate.into_certified_key()?,
        })
    }
}

impl fmt::Debug for StaticCertificateProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCertificateProvider")
            .field("chain_len", &self.key.cert.len())
            .finish()
    }
}

impl CertificateProvider for StaticCertificateProvider {
    fn certificate_for(&self, _server_name: &str) -> Result<Arc<CertifiedKey>, CertError> {
        Ok(self.key.clone())
    }
}

/// Upper bound on cached self-signed certificates
const MAX_CACHED_CERTIFICATES: usize = 1024;

type NameFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Generates and caches a self-signed certificate per server name
///
/// With a name filter, names the relay does not serve share the certificate
/// of the fallback name instead of getting one each.
pub struct SelfSignedProvider {
    cache: DashMap<String, Arc<CertifiedKey>>,
    max_cached: usize,
    filter: Option<(String, NameFilter)>,
}

impl Default for SelfSignedProvider {
    fn default() -> Self {
        Self {
            cache: DashMap::new(),
            max_cached: MAX_CACHED_CERTIFICATES,
            filter: None,
        }
    }
}

impl SelfSignedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only issue per-name certificates for names `serves` accepts
    pub fn serving_only(
        mut self,
        fallback_name: impl Into<String>,
        serves: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some((fallback_name.into(), Arc::new(serves)));
        self
    }

    #[cfg(test)]
    fn with_max_cached(mut self, max_cached: usize) -> Self {
        self.max_cached = max_cached.max(1);
        self
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn issue_name<'a>(&'a self, server_name: &'a str) -> &'a str {
        match &self.filter {
            Some((fallback, serves)) if server_name != fallback.as_str() && !serves(server_name) => {
                debug!("{} is not served here; using the {} certificate", server_name, fallback);
                fallback.as_str()
            }
            _ => server_name,
        }
    }

    fn evict_one(&self) {
        let victim = self.cache.iter().next().map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            self.cache.remove(&victim);
        }
    }
}

impl fmt::Debug for SelfSignedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfSignedProvider")
            .field("cached", &self.cache.len())
            .field("max_cached", &self.max_cached)
            .field("fallback_name", &self.filter.as_ref().map(|(name, _)| name))
            .finish()
    }
}

impl CertificateProvider for SelfSignedProvider {
    fn certificate_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertError> {
        if server_name.is_empty() {
            return Err(CertError::NoCertificate("empty server name".to_string()));
        }
        let name = self.issue_name(server_name);
        if let Some(key) = self.cache.get(name) {
            return Ok(key.value().clone());
        }

        // Two handshakes racing on a new name may both generate; the last insert wins
        let key = generate_self_signed_cert(&[name.to_string()])?.into_certified_key()?;
        while self.cache.len() >= self.max_cached {
            self.evict_one();
        }
        self.cache.insert(name.to_string(), key.clone());
        Ok(key)
    }
}

/// Adapts a [`CertificateProvider`] to rustls' certificate resolver
///
/// Clients without SNI are served the certificate for `fallback_name`.
pub struct ProviderResolver {
    provider: Arc<dyn CertificateProvider>,
    fallback_name: String,
}

impl ProviderResolver {
    pub fn new(provider: Arc<dyn CertificateProvider>, fallback_name: impl Into<String>) -> Self {
        Self {
            provider,
            fallback_name: fallback_name.into(),
        }
    }
}

impl fmt::Debug for ProviderResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderResolver")
            .field("provider", &self.provider)
            .field("fallback_name", &self.fallback_name)
            .finish()
    }
}

impl ResolvesServerCert for ProviderResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name().unwrap_or(&self.fallback_name);
        match self.provider.certificate_for(name) {
            Ok(key) => {
                debug!("Resolved certificate for {}", name);
                Some(key)
            }
            Err(e) => {
                warn!("No certificate for {}: {}", name, e);
                None
            }
        }
    }
}

/// Build a TLS server config that resolves certificates through `provider`
pub fn server_config(
    provider: Arc<dyn CertificateProvider>,
    fallback_name: &str,
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<Arc<ServerConfig>, CertError> {
    let crypto = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(crypto)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ProviderResolver::new(provider, fallback_name)));
    config.alpn_protocols = alpn_protocols;
    Ok(Arc::new(config))
}
