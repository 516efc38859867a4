//! HTTP reverse proxy for tunnels the relay terminates itself

use crate::router::{request_host, ConnectionInfo};
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use portico_proto::Tunnel;
use tracing::{debug, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Forwards requests to `http://{backend_host}:{backend_port}`
///
/// Redirects from the backend are passed to the client as-is.
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client<HttpConnector, Body>,
    backend_host: String,
    behind_proxy: bool,
}

impl ReverseProxy {
    /// `behind_proxy` keeps an incoming `X-Forwarded-For` chain and appends to
    /// it; otherwise the header is replaced with the peer address.
    pub fn new(backend_host: impl Into<String>, behind_proxy: bool) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            backend_host: backend_host.into(),
            behind_proxy,
        }
    }

    pub async fn forward(
        &self,
        mut req: Request,
        tunnel: &Tunnel,
        conn: Option<ConnectionInfo>,
    ) -> Response {
        let host = request_host(&req);
        let original_host = req
            .headers()
            .get(axum::http::header::HOST)
            .cloned()
            .or_else(|| HeaderValue::from_str(&host).ok());

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!(
            "http://{}:{}{}",
            self.backend_host, tunnel.backend_port, path_and_query
        );
        match target.parse::<Uri>() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => {
                warn!("Invalid backend URI {}: {}", target, e);
                return (StatusCode::BAD_REQUEST, "Invalid request URI").into_response();
            }
        }
        // Backends behind tunnels are spoken to over HTTP/1.1
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        if let Some(original_host) = original_host {
            headers.insert(axum::http::header::HOST, original_host.clone());
            headers.insert(X_FORWARDED_HOST, original_host);
        }
        let proto = if conn.map(|c| c.tls).unwrap_or(true) {
            "https"
        } else {
            "http"
        };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        if let Some(conn) = conn {
            set_forwarded_for(headers, &conn.peer_addr.ip().to_string(), self.behind_proxy);
        }

        debug!("Proxying {} to {}", host, target);
        match self.client.request(req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                warn!("Backend request for {} to {} failed: {}", host, target, e);
                (
                    StatusCode::BAD_GATEWAY,
                    format!("Failed to reach backend for {}", host),
                )
                    .into_response()
            }
        }
    }
}

fn set_forwarded_for(headers: &mut HeaderMap, remote_ip: &str, behind_proxy: bool) {
    let existing = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    let value = match existing {
        Some(chain) if behind_proxy => format!("{}, {}", chain, remote_ip),
        _ => remote_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}
