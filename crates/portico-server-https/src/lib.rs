//! The relay's own HTTP stack
//!
//! Serves connections the TLS port hands off (admin domain, unknown hosts,
//! `server`-mode tunnels) and the plain HTTP port.

pub mod proxy;
pub mod redirect;
pub mod router;
pub mod server;

pub use proxy::ReverseProxy;
pub use redirect::{redirect_router, PlainHttpConfig, PlainHttpServer};
pub use router::{
    classify, local_router, request_host, ConnectionInfo, LocalRoute, LocalRouters,
    BOOTSTRAP_CALLBACK_PATH,
};
pub use server::{alpn_protocols, HttpsServerError, LocalHttpsServer};
