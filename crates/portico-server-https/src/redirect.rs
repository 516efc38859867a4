//! Plain HTTP listener
//!
//! Redirects every request to HTTPS, or with `allow_http` serves the local
//! router over plain HTTP.

use crate::router::{request_host, ConnectionInfo};
use crate::server::{serve_connection, HttpsServerError};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct PlainHttpConfig {
    pub bind_addr: SocketAddr,
    /// Port named in redirect targets
    pub https_port: u16,
    /// Serve the local router instead of redirecting
    pub allow_http: bool,
}

impl Default for PlainHttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            https_port: 443,
            allow_http: false,
        }
    }
}

pub struct PlainHttpServer {
    config: PlainHttpConfig,
    router: Router,
}

impl PlainHttpServer {
    /// `local` is only served when `allow_http` is set
    pub fn new(config: PlainHttpConfig, local: Router) -> Self {
        let router = if config.allow_http {
            local
        } else {
            redirect_router(config.https_port)
        };
        Self { config, router }
    }

    pub async fn start(&self) -> Result<(), HttpsServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| HttpsServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), HttpsServerError> {
        info!(
            "HTTP server listening on {} ({})",
            listener.local_addr()?,
            if self.config.allow_http {
                "serving plain HTTP"
            } else {
                "redirecting to HTTPS"
            }
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let router = self.router.clone();
                    let info = ConnectionInfo {
                        peer_addr,
                        tls: false,
                    };
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(socket, router, info).await {
                            debug!("HTTP connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                }
            }
        }
    }
}

/// Router answering every request with a 301 to the HTTPS port
pub fn redirect_router(https_port: u16) -> Router {
    Router::new().fallback(redirect).with_state(https_port)
}

async fn redirect(State(https_port): State<u16>, req: Request) -> Response {
    let host = request_host(&req);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, https_port, path_and_query)
    };

    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
}
