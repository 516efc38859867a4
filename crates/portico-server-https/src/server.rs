//! HTTPS server over connections handed off by the TLS port
//!
//! Nothing is bound here: connections arrive through an
//! [`InjectableListener`], already sniffed, and are TLS-terminated with
//! certificates from the shared [`CertificateProvider`].

use crate::router::ConnectionInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use portico_cert::{server_config, CertError, CertificateProvider};
use portico_server_tls::{HandoffConnection, InjectableListener};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum HttpsServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("HTTP connection error: {0}")]
    Http(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// ALPN protocols offered on handed-off connections
pub fn alpn_protocols() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

pub struct LocalHttpsServer {
    listener: InjectableListener<HandoffConnection>,
    acceptor: TlsAcceptor,
    router: Router,
}

impl LocalHttpsServer {
    /// `fallback_name` picks the certificate for clients that sent no SNI
    pub fn new(
        listener: InjectableListener<HandoffConnection>,
        certificates: Arc<dyn CertificateProvider>,
        fallback_name: &str,
        router: Router,
    ) -> Result<Self, HttpsServerError> {
        let config = server_config(certificates, fallback_name, alpn_protocols())?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(config),
            router,
        })
    }

    /// Serve handed-off connections until the listener is closed
    pub async fn run(self) -> Result<(), HttpsServerError> {
        match self.listener.local_addr() {
            Some(addr) => info!("Local HTTPS server ready for connections handed off from {}", addr),
            None => info!("Local HTTPS server ready for handed-off connections"),
        }

        while let Ok(conn) = self.listener.accept().await {
            let acceptor = self.acceptor.clone();
            let router = self.router.clone();
            let peer_addr = conn.peer_addr;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(conn, acceptor, router).await {
                    debug!("HTTPS connection error from {}: {}", peer_addr, e);
                }
            });
        }

        info!("Local HTTPS listener closed");
        Ok(())
    }
}

async fn handle_connection(
    conn: HandoffConnection,
    acceptor: TlsAcceptor,
    router: Router,
) -> Result<(), HttpsServerError> {
    let HandoffConnection {
        stream,
        peer_addr,
        reason,
    } = conn;
    debug!(
        "Terminating TLS for {} (SNI '{}', {})",
        peer_addr,
        stream.server_name(),
        reason
    );

    let tls = acceptor
        .accept(stream)
        .await
        .map_err(HttpsServerError::Handshake)?;

    serve_connection(
        tls,
        router,
        ConnectionInfo {
            peer_addr,
            tls: true,
        },
    )
    .await
}

/// Serve HTTP/1.1 or HTTP/2 on one connection with `router`
pub(crate) async fn serve_connection<I>(
    io: I,
    router: Router,
    info: ConnectionInfo,
) -> Result<(), HttpsServerError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
        request.extensions_mut().insert(info);
        router.clone().call(request)
    });

    auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await
        .map_err(|e| HttpsServerError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ReverseProxy;
    use crate::router::{local_router, LocalRouters};
    use axum::routing::get;
    use portico_cert::{backend_client_config, BackendVerification, SelfSignedProvider};
    use portico_router::{HandoffReason, TunnelRegistry, TunnelStore};
    use portico_server_tls::sniff;
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::TlsConnector;

    /// Read until EOF, tolerating a missing close_notify
    async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_serves_handed_off_connection_over_tls() {
        let store = Arc::new(TunnelStore::new());
        store.set_admin_domain("admin.example".to_string());
        let routers = LocalRouters {
            admin_api: Router::new().route("/status", get(|| async { "relay ok" })),
            ..Default::default()
        };
        let app = local_router(store, routers, ReverseProxy::new("127.0.0.1", false));

        let (listener, injector) = InjectableListener::new();
        let server = LocalHttpsServer::new(
            listener,
            Arc::new(SelfSignedProvider::new()),
            "admin.example",
            app,
        )
        .unwrap();
        tokio::spawn(server.run());

        // Stand in for the TLS port: accept, sniff, push
        let public = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public_addr = public.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, peer_addr) = public.accept().await.unwrap();
            let stream = sniff(socket).await.unwrap();
            injector
                .push(HandoffConnection {
                    stream,
                    peer_addr,
                    reason: HandoffReason::AdminDomain,
                })
                .unwrap();
        });

        let connector =
            TlsConnector::from(backend_client_config(BackendVerification::AcceptAny).unwrap());
        let socket = TcpStream::connect(public_addr).await.unwrap();
        let mut tls = connector
            .connect(ServerName::try_from("admin.example").unwrap(), socket)
            .await
            .unwrap();

        tls.write_all(
            b"GET /api/status HTTP/1.1\r\nHost: admin.example\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
        let response = read_response(&mut tls).await;

        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("relay ok"), "{}", response);
    }

    #[tokio::test]
    async fn test_run_returns_when_listener_closes() {
        let (listener, injector) = InjectableListener::new();
        let app = Router::new();
        let server =
            LocalHttpsServer::new(listener, Arc::new(SelfSignedProvider::new()), "localhost", app)
                .unwrap();

        let handle = tokio::spawn(server.run());
        drop(injector);
        assert!(handle.await.unwrap().is_ok());
    }

    #[test]
    fn test_alpn_prefers_h2() {
        assert_eq!(alpn_protocols()[0], b"h2".to_vec());
    }
}
