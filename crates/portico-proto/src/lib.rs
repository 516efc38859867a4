//! Shared data model for the Portico relay
//!
//! Defines the tunnel record consumed by the connection router and the
//! immutable relay context handed down to the proxy strategies.

pub mod context;
pub mod tunnel;

pub use context::RelayContext;
pub use tunnel::{ParseTerminationError, TlsTermination, Tunnel};
