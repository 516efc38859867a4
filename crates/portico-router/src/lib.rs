//! Routing logic for the public TLS port
//!
//! Parses the TLS ClientHello for its server name, looks the name up in the
//! tunnel registry, and decides which proxy strategy owns the connection.

pub mod registry;
pub mod route;
pub mod sni;

pub use registry::{RegistryError, RegistrySnapshot, TunnelRegistry, TunnelStore};
pub use route::{HandoffReason, RouteDecision, TunnelRouter};
pub use sni::{SniError, MAX_RECORD_LEN, RECORD_HEADER_LEN};
