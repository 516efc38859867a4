//! Tunnel registry
//!
//! The router only reads from the registry. Writers (tunnel establishment,
//! admin tooling) go through [`TunnelStore`] directly. Entries live in a
//! `DashMap`, so a concurrent lookup sees either the old or the new tunnel,
//! never a partially written one.

use dashmap::DashMap;
use portico_proto::Tunnel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info};

/// Read-side contract the connection router depends on
#[cfg_attr(test, mockall::automock)]
pub trait TunnelRegistry: Send + Sync {
    /// Lookup a tunnel by its public hostname
    fn lookup_tunnel(&self, hostname: &str) -> Option<Tunnel>;

    /// Hostname serving the relay's own API and web UI (empty when unset)
    fn admin_domain(&self) -> String;

    fn set_admin_domain(&self, domain: String);
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid registry file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Duplicate tunnel hostname: {0}")]
    DuplicateHostname(String),
}

/// On-disk form of the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub admin_domain: String,
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
}

/// In-memory tunnel registry
#[derive(Debug, Default)]
pub struct TunnelStore {
    tunnels: DashMap<String, Tunnel>,
    admin_domain: RwLock<String>,
}

impl TunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a snapshot, rejecting duplicate hostnames
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Result<Self, RegistryError> {
        let store = Self::new();
        store.set_admin_domain(snapshot.admin_domain);

        for tunnel in snapshot.tunnels {
            let key = normalize(&tunnel.hostname);
            if store.tunnels.contains_key(&key) {
                return Err(RegistryError::DuplicateHostname(key));
            }
            store.tunnels.insert(key, tunnel);
        }

        Ok(store)
    }

    /// Load a registry snapshot from a JSON file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let snapshot: RegistrySnapshot = serde_json::from_slice(&data)?;
        let store = Self::from_snapshot(snapshot)?;

        info!(
            "Loaded {} tunnel(s) from {}",
            store.tunnels.len(),
            path.display()
        );
        Ok(store)
    }

    /// Insert or replace a tunnel, returning the previous entry
    pub fn upsert(&self, tunnel: Tunnel) -> Option<Tunnel> {
        debug!(
            "Registering tunnel: {} -> port {} ({})",
            tunnel.hostname, tunnel.backend_port, tunnel.tls_termination
        );
        self.tunnels.insert(normalize(&tunnel.hostname), tunnel)
    }

    /// Remove a tunnel when its owning session ends
    pub fn unregister(&self, hostname: &str) -> Result<Tunnel, RegistryError> {
        debug!("Unregistering tunnel for hostname: {}", hostname);
        self.tunnels
            .remove(&normalize(hostname))
            .map(|(_, tunnel)| tunnel)
            .ok_or_else(|| RegistryError::TunnelNotFound(hostname.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Point-in-time copy of the registry
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut tunnels: Vec<Tunnel> = self.tunnels.iter().map(|e| e.value().clone()).collect();
        tunnels.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        RegistrySnapshot {
            admin_domain: self.admin_domain(),
            tunnels,
        }
    }
}

impl TunnelRegistry for TunnelStore {
    fn lookup_tunnel(&self, hostname: &str) -> Option<Tunnel> {
        self.tunnels
            .get(&normalize(hostname))
            .map(|entry| entry.value().clone())
    }

    fn admin_domain(&self) -> String {
        self.admin_domain
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_admin_domain(&self, domain: String) {
        let domain = normalize(&domain);
        info!("Admin domain set to '{}'", domain);
        *self.admin_domain.write().unwrap_or_else(|e| e.into_inner()) = domain;
    }
}

fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
