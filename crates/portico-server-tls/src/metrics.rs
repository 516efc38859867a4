//! Per-connection byte accounting

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Counters for one proxied connection, shared by both copy directions
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub connection_id: String,
    pub server_name: String,
    pub peer_addr: SocketAddr,
    bytes_received: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    connected_at: DateTime<Utc>,
}

impl ConnectionMetrics {
    pub fn new(server_name: impl Into<String>, peer_addr: SocketAddr) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            server_name: server_name.into(),
            peer_addr,
            bytes_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            connected_at: Utc::now(),
        }
    }

    /// Bytes read from the client
    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Bytes written to the client
    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Log the final counters once both directions are done
    pub fn finish(&self) {
        let duration_ms = (Utc::now() - self.connected_at).num_milliseconds();
        info!(
            connection_id = %self.connection_id,
            sni = %self.server_name,
            peer = %self.peer_addr,
            bytes_received = self.bytes_received(),
            bytes_sent = self.bytes_sent(),
            duration_ms,
            "Connection closed"
        );
    }
}
