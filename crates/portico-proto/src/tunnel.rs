//! Tunnel records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Who decrypts TLS for a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsTermination {
    /// The tunnel client terminates TLS; the relay forwards raw bytes
    Client,
    /// The backend terminates TLS; the relay forwards raw bytes
    Passthrough,
    /// The tunnel client terminates TLS over an encrypted hop; raw bytes at the relay
    ClientTls,
    /// The relay terminates client TLS and speaks TLS again to the backend
    ServerTls,
    /// The relay terminates TLS and reverse-proxies HTTP to a plaintext backend
    Server,
}

impl TlsTermination {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsTermination::Client => "client",
            TlsTermination::Passthrough => "passthrough",
            TlsTermination::ClientTls => "client-tls",
            TlsTermination::ServerTls => "server-tls",
            TlsTermination::Server => "server",
        }
    }
}

impl fmt::Display for TlsTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown TLS termination mode: {0}")]
pub struct ParseTerminationError(pub String);

impl FromStr for TlsTermination {
    type Err = ParseTerminationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(TlsTermination::Client),
            "passthrough" => Ok(TlsTermination::Passthrough),
            "client-tls" => Ok(TlsTermination::ClientTls),
            "server-tls" => Ok(TlsTermination::ServerTls),
            "server" => Ok(TlsTermination::Server),
            other => Err(ParseTerminationError(other.to_string())),
        }
    }
}

/// A public hostname mapped to a locally reachable backend port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub hostname: String,
    pub backend_port: u16,
    pub tls_termination: TlsTermination,
}

impl Tunnel {
    pub fn new(hostname: impl Into<String>, backend_port: u16, tls_termination: TlsTermination) -> Self {
        Self {
            hostname: hostname.into(),
            backend_port,
            tls_termination,
        }
    }
}
