//! Public TLS port of the relay
//!
//! Accepts raw TCP, sniffs the TLS ClientHello, and dispatches each connection
//! to raw passthrough, TLS re-encryption, or the relay's own HTTPS stack.

pub mod listener;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod sniffer;

pub use listener::{ConnectionInjector, HandoffConnection, InjectableListener, ListenerClosedError};
pub use metrics::ConnectionMetrics;
pub use proxy::{passthrough, proxy_bidirectional, reencrypt, ProxyError};
pub use server::{TlsServer, TlsServerConfig, TlsServerError};
pub use sniffer::{sniff, SniffError, SniffedStream};
