//! Control-plane context shared with the data path

use serde::Serialize;
use std::net::IpAddr;

/// Immutable snapshot of relay-wide settings
///
/// Built once at startup and shared behind an `Arc`. The data path only reads it.
#[derive(Debug, Clone, Serialize)]
pub struct RelayContext {
    /// Port tunnel clients use to establish SSH tunnels
    pub ssh_server_port: u16,
    /// Public address of this relay, empty when discovery failed
    pub public_ip: String,
    /// Whether certificates are managed automatically
    pub auto_certs: bool,
}

impl RelayContext {
    pub fn new(ssh_server_port: u16, public_ip: impl Into<String>, auto_certs: bool) -> Self {
        Self {
            ssh_server_port,
            public_ip: public_ip.into(),
            auto_certs,
        }
    }

    /// DNS record type that points a hostname at this relay
    pub fn address_record_type(&self) -> &'static str {
        match self.public_ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => "AAAA",
            _ => "A",
        }
    }
}
