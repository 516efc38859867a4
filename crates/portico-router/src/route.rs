//! Per-connection routing decision

use crate::registry::TunnelRegistry;
use portico_proto::{TlsTermination, Tunnel};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Why a connection is served by the relay's own HTTPS stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffReason {
    /// SNI matches the admin domain
    AdminDomain,
    /// No tunnel is registered for the SNI
    NoTunnel,
    /// The tunnel asks the relay to terminate TLS and proxy HTTP
    ServerTermination,
}

impl fmt::Display for HandoffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandoffReason::AdminDomain => "admin-domain",
            HandoffReason::NoTunnel => "no-tunnel",
            HandoffReason::ServerTermination => "server-termination",
        })
    }
}

/// Terminal routing outcome for a sniffed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Push into the local HTTPS stack
    LocalHandoff(HandoffReason),
    /// Copy raw bytes to the backend
    Passthrough(Tunnel),
    /// Terminate client TLS and open a new TLS session to the backend
    Reencrypt(Tunnel),
}

/// Maps a sniffed server name to a [`RouteDecision`]
#[derive(Clone)]
pub struct TunnelRouter {
    registry: Arc<dyn TunnelRegistry>,
}

impl TunnelRouter {
    pub fn new(registry: Arc<dyn TunnelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn TunnelRegistry> {
        &self.registry
    }

    /// Decide where a connection for `server_name` goes
    ///
    /// The admin domain always wins over a tunnel registered under the same name.
    /// An empty server name never matches the admin domain.
    pub fn route(&self, server_name: &str) -> RouteDecision {
        let admin_domain = self.registry.admin_domain();
        if !server_name.is_empty() && server_name.eq_ignore_ascii_case(&admin_domain) {
            trace!("SNI {} is the admin domain", server_name);
            return RouteDecision::LocalHandoff(HandoffReason::AdminDomain);
        }

        let Some(tunnel) = self.registry.lookup_tunnel(server_name) else {
            trace!("No tunnel for SNI '{}'", server_name);
            return RouteDecision::LocalHandoff(HandoffReason::NoTunnel);
        };

        match tunnel.tls_termination {
            TlsTermination::Client | TlsTermination::Passthrough | TlsTermination::ClientTls => {
                RouteDecision::Passthrough(tunnel)
            }
            TlsTermination::ServerTls => RouteDecision::Reencrypt(tunnel),
            TlsTermination::Server => RouteDecision::LocalHandoff(HandoffReason::ServerTermination),
        }
    }

    /// Whether the relay terminates TLS for `server_name` under its own certificate
    pub fn terminates_tls(&self, server_name: &str) -> bool {
        matches!(
            self.route(server_name),
            RouteDecision::Reencrypt(_)
                | RouteDecision::LocalHandoff(
                    HandoffReason::AdminDomain | HandoffReason::ServerTermination
                )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MockTunnelRegistry;

    fn router_with(admin: &'static str, tunnel: Option<Tunnel>) -> TunnelRouter {
        let mut registry = MockTunnelRegistry::new();
        registry
            .expect_admin_domain()
            .returning(move || admin.to_string());
        registry
            .expect_lookup_tunnel()
            .returning(move |_| tunnel.clone());
        TunnelRouter::new(Arc::new(registry))
    }

    #[test]
    fn test_passthrough_modes_dispatch_to_passthrough() {
        for mode in [
            TlsTermination::Client,
            TlsTermination::Passthrough,
            TlsTermination::ClientTls,
        ] {
            let tunnel = Tunnel::new("a.example", 9001, mode);
            let router = router_with("admin.example", Some(tunnel.clone()));
            assert_eq!(router.route("a.example"), RouteDecision::Passthrough(tunnel));
        }
    }

    #[test]
    fn test_server_tls_dispatches_to_reencrypt() {
        let tunnel = Tunnel::new("a.example", 9001, TlsTermination::ServerTls);
        let router = router_with("admin.example", Some(tunnel.clone()));
        assert_eq!(router.route("a.example"), RouteDecision::Reencrypt(tunnel));
    }

    #[test]
    fn test_server_mode_hands_off_locally() {
        let tunnel = Tunnel::new("a.example", 9001, TlsTermination::Server);
        let router = router_with("admin.example", Some(tunnel));
        assert_eq!(
            router.route("a.example"),
            RouteDecision::LocalHandoff(HandoffReason::ServerTermination)
        );
    }

    #[test]
    fn test_unknown_host_hands_off_locally() {
        let router = router_with("admin.example", None);
        assert_eq!(
            router.route("nobody.example"),
            RouteDecision::LocalHandoff(HandoffReason::NoTunnel)
        );
    }

    #[test]
    fn test_admin_domain_wins_over_registered_tunnel() {
        let mut registry = MockTunnelRegistry::new();
        registry
            .expect_admin_domain()
            .returning(|| "admin.example".to_string());
        // The registry must not even be consulted for the admin domain
        registry.expect_lookup_tunnel().never();
        let router = TunnelRouter::new(Arc::new(registry));

        assert_eq!(
            router.route("admin.example"),
            RouteDecision::LocalHandoff(HandoffReason::AdminDomain)
        );
    }

    #[test]
    fn test_missing_sni_never_matches_unset_admin_domain() {
        let mut registry = MockTunnelRegistry::new();
        registry.expect_admin_domain().returning(String::new);
        registry
            .expect_lookup_tunnel()
            .withf(|hostname| hostname.is_empty())
            .times(1)
            .returning(|_| None);
        let router = TunnelRouter::new(Arc::new(registry));

        assert_eq!(
            router.route(""),
            RouteDecision::LocalHandoff(HandoffReason::NoTunnel)
        );
    }

    #[test]
    fn test_terminates_tls_only_for_served_names() {
        let tunnel = Tunnel::new("a.example", 9001, TlsTermination::ServerTls);
        assert!(router_with("admin.example", Some(tunnel)).terminates_tls("a.example"));

        let tunnel = Tunnel::new("a.example", 9001, TlsTermination::Server);
        assert!(router_with("admin.example", Some(tunnel)).terminates_tls("a.example"));

        let tunnel = Tunnel::new("a.example", 9001, TlsTermination::Passthrough);
        assert!(!router_with("admin.example", Some(tunnel)).terminates_tls("a.example"));

        let router = router_with("admin.example", None);
        assert!(router.terminates_tls("admin.example"));
        assert!(!router.terminates_tls("scan-1.invalid"));
    }
}
