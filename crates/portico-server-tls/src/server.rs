//! Acceptor loop for the public TLS port
//!
//! Every accepted connection gets its own task: sniff the ClientHello, ask the
//! [`TunnelRouter`] where it goes, and hand it to exactly one strategy.
//! Connections the relay serves itself are pushed into an
//! [`InjectableListener`](crate::listener::InjectableListener) through the
//! [`ConnectionInjector`].

use crate::listener::{ConnectionInjector, HandoffConnection};
use crate::metrics::ConnectionMetrics;
use crate::proxy::{self, ProxyError};
use crate::sniffer::{sniff, SniffError};
use portico_cert::{
    backend_client_config, server_config, BackendVerification, CertError, CertificateProvider,
};
use portico_proto::Tunnel;
use portico_router::{RouteDecision, TunnelRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TlsServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Handshake sniffing failed: {0}")]
    Sniff(#[from] SniffError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Local HTTPS listener is closed")]
    HandoffClosed,

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub bind_addr: SocketAddr,
    /// Host the backend ports of tunnels are reachable on
    pub backend_host: String,
}

impl Default for TlsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            backend_host: "localhost".to_string(),
        }
    }
}

/// State shared by every connection task
struct ConnectionHandler {
    backend_host: String,
    router: TunnelRouter,
    injector: ConnectionInjector<HandoffConnection>,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

pub struct TlsServer {
    config: TlsServerConfig,
    handler: Arc<ConnectionHandler>,
}

impl TlsServer {
    /// Create a TLS server routing through `router`
    ///
    /// `certificates` serves the client-facing side of re-encrypted tunnels;
    /// `verification` decides how backend certificates are checked.
    pub fn new(
        config: TlsServerConfig,
        router: TunnelRouter,
        injector: ConnectionInjector<HandoffConnection>,
        certificates: Arc<dyn CertificateProvider>,
        verification: BackendVerification,
    ) -> Result<Self, TlsServerError> {
        let acceptor = TlsAcceptor::from(server_config(certificates, "localhost", vec![])?);
        let connector = TlsConnector::from(backend_client_config(verification)?);

        let handler = Arc::new(ConnectionHandler {
            backend_host: config.backend_host.clone(),
            router,
            injector,
            acceptor,
            connector,
        });

        Ok(Self { config, handler })
    }

    pub fn router(&self) -> &TunnelRouter {
        &self.handler.router
    }

    /// Bind the public port and accept forever
    pub async fn start(&self) -> Result<(), TlsServerError> {
        info!("TLS server starting on {}", self.config.bind_addr);

        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| TlsServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        self.serve(listener).await
    }

    /// Accept on an already-bound listener
    ///
    /// Accept errors are logged and the loop keeps going; it only returns if
    /// the listener can no longer report its address.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TlsServerError> {
        info!(
            "TLS server listening on {} (SNI routing)",
            listener.local_addr()?
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("New TLS connection from {}", peer_addr);
                    let handler = self.handler.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(socket, peer_addr).await {
                            match e {
                                TlsServerError::Sniff(e) => {
                                    debug!("Rejected connection from {}: {}", peer_addr, e)
                                }
                                e => warn!("Connection from {} failed: {}", peer_addr, e),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("TLS listener accept error: {}", e);
                }
            }
        }
    }
}

impl ConnectionHandler {
    async fn handle(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<(), TlsServerError> {
        let _ = socket.set_nodelay(true);
        let stream = sniff(socket).await?;
        let server_name = stream.server_name().to_string();

        match self.router.route(&server_name) {
            RouteDecision::LocalHandoff(reason) => {
                debug!(
                    "Handing {} (SNI '{}', {} bytes buffered) to the local HTTPS stack: {}",
                    peer_addr,
                    server_name,
                    stream.buffered().len(),
                    reason
                );
                self.injector
                    .push(HandoffConnection {
                        stream,
                        peer_addr,
                        reason,
                    })
                    .map_err(|_| TlsServerError::HandoffClosed)
            }
            RouteDecision::Passthrough(tunnel) => {
                let backend_addr = self.backend_addr(&tunnel);
                info!(
                    "TLS connection from {} for SNI {} -> {} (passthrough)",
                    peer_addr, server_name, backend_addr
                );

                let metrics = ConnectionMetrics::new(&server_name, peer_addr);
                let result = proxy::passthrough(stream, &backend_addr, &metrics).await;
                metrics.finish();
                Ok(result?)
            }
            RouteDecision::Reencrypt(tunnel) => {
                let backend_addr = self.backend_addr(&tunnel);
                info!(
                    "TLS connection from {} for SNI {} -> {} (re-encrypt)",
                    peer_addr, server_name, backend_addr
                );

                let metrics = ConnectionMetrics::new(&server_name, peer_addr);
                let result = proxy::reencrypt(
                    stream,
                    &tunnel.hostname,
                    &backend_addr,
                    &self.acceptor,
                    &self.connector,
                    &metrics,
                )
                .await;
                metrics.finish();
                Ok(result?)
            }
        }
    }

    fn backend_addr(&self, tunnel: &Tunnel) -> String {
        format!("{}:{}", self.backend_host, tunnel.backend_port)
    }
}
