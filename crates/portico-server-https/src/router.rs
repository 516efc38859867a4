//! Host-based request routing for the relay's own HTTP stack
//!
//! Every request is classified by path and `Host`:
//! 1. `/namedrop/callback` goes to the domain bootstrap router
//! 2. the admin domain goes to the admin API (`/api/*`, prefix stripped) or the web UI
//! 3. a registered tunnel is reverse-proxied to its backend port
//! 4. anything else gets `500 No tunnel attached to {host}`

use crate::proxy::ReverseProxy;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use portico_proto::Tunnel;
use portico_router::TunnelRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Path the domain bootstrap flow redirects back to, on any host
pub const BOOTSTRAP_CALLBACK_PATH: &str = "/namedrop/callback";

/// Per-connection facts attached to every request as an extension
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    /// Whether the request arrived over TLS
    pub tls: bool,
}

/// Where a request is served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalRoute {
    Bootstrap,
    AdminApi,
    AdminUi,
    Tunnel(Tunnel),
    NoTunnel,
}

/// Routers owned by the embedding application
#[derive(Clone, Default)]
pub struct LocalRouters {
    pub bootstrap: Router,
    /// Sees paths with the `/api` prefix removed
    pub admin_api: Router,
    pub admin_ui: Router,
}

#[derive(Clone)]
struct LocalState {
    registry: Arc<dyn TunnelRegistry>,
    routers: LocalRouters,
    proxy: ReverseProxy,
}

/// Classify a request by its bare host and path
pub fn classify(registry: &dyn TunnelRegistry, host: &str, path: &str) -> LocalRoute {
    if path == BOOTSTRAP_CALLBACK_PATH {
        return LocalRoute::Bootstrap;
    }

    let admin_domain = registry.admin_domain();
    if !host.is_empty() && host.eq_ignore_ascii_case(&admin_domain) {
        return if path.starts_with("/api/") {
            LocalRoute::AdminApi
        } else {
            LocalRoute::AdminUi
        };
    }

    match registry.lookup_tunnel(host) {
        Some(tunnel) => LocalRoute::Tunnel(tunnel),
        None => LocalRoute::NoTunnel,
    }
}

/// Build the router served on handed-off TLS connections and plain HTTP
pub fn local_router(
    registry: Arc<dyn TunnelRegistry>,
    routers: LocalRouters,
    proxy: ReverseProxy,
) -> Router {
    let state = LocalState {
        registry,
        routers,
        proxy,
    };

    Router::new()
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(State(state): State<LocalState>, req: Request) -> Response {
    let host = request_host(&req);
    let conn = req.extensions().get::<ConnectionInfo>().copied();

    info!(
        "{} {} {} {} {}",
        chrono::Utc::now().to_rfc3339(),
        conn.map(|c| c.peer_addr.ip().to_string())
            .unwrap_or_else(|| "-".to_string()),
        req.method(),
        host,
        req.uri().path()
    );

    match classify(state.registry.as_ref(), &host, req.uri().path()) {
        LocalRoute::Bootstrap => serve_with(state.routers.bootstrap, req).await,
        LocalRoute::AdminApi => serve_with(state.routers.admin_api, strip_api_prefix(req)).await,
        LocalRoute::AdminUi => serve_with(state.routers.admin_ui, req).await,
        LocalRoute::Tunnel(tunnel) => state.proxy.forward(req, &tunnel, conn).await,
        LocalRoute::NoTunnel => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("No tunnel attached to {}", host),
        )
            .into_response(),
    }
}

async fn serve_with(router: Router, req: Request) -> Response {
    match router.oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// Host of a request without port, lowercased
///
/// HTTP/2 requests carry it in the URI authority instead of a `Host` header.
pub fn request_host<B>(req: &axum::http::Request<B>) -> String {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .or_else(|| req.uri().host())
        .unwrap_or("");

    strip_port(host).trim_end_matches('.').to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literal, e.g. [::1]:8080
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

fn strip_api_prefix(mut req: Request) -> Request {
    let stripped = req
        .uri()
        .path_and_query()
        .and_then(|pq| pq.as_str().strip_prefix("/api"))
        .unwrap_or("/")
        .to_string();

    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = stripped.parse().ok();
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
    req
}
