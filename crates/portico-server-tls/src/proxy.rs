//! Proxy strategies: raw passthrough and TLS re-encryption
//!
//! Both strategies end in [`proxy_bidirectional`]: two copy loops over split
//! halves, each half-closing its writer when its reader hits EOF. The
//! connection is dropped only after both directions are done.

use crate::metrics::ConnectionMetrics;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to connect to backend {addr}: {source}")]
    BackendDial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with backend {addr} failed: {source}")]
    BackendTls {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with client failed: {0}")]
    ClientTls(#[source] io::Error),

    #[error("Invalid server name for backend handshake: {0}")]
    InvalidServerName(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Forward raw bytes between the client and `backend_addr`
///
/// The client's TLS session is carried end to end; the relay never sees
/// plaintext.
pub async fn passthrough<C>(
    client: C,
    backend_addr: &str,
    metrics: &ConnectionMetrics,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let backend = dial(backend_addr).await?;
    debug!("Passthrough {} -> {}", metrics.server_name, backend_addr);

    proxy_bidirectional(client, backend, metrics).await;
    Ok(())
}

/// Terminate the client's TLS and open a fresh TLS session to the backend
///
/// The backend handshake happens first so an unreachable backend closes the
/// client before it completes a handshake with the relay. The backend sees
/// `hostname` as SNI.
pub async fn reencrypt<C>(
    client: C,
    hostname: &str,
    backend_addr: &str,
    acceptor: &TlsAcceptor,
    connector: &TlsConnector,
    metrics: &ConnectionMetrics,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| ProxyError::InvalidServerName(hostname.to_string()))?;

    let backend = dial(backend_addr).await?;
    let backend = connector
        .connect(server_name, backend)
        .await
        .map_err(|source| ProxyError::BackendTls {
            addr: backend_addr.to_string(),
            source,
        })?;

    let client = acceptor.accept(client).await.map_err(ProxyError::ClientTls)?;
    debug!("Re-encrypting {} -> {}", hostname, backend_addr);

    proxy_bidirectional(client, backend, metrics).await;
    Ok(())
}

/// Copy both directions until each has seen EOF or an error
pub async fn proxy_bidirectional<C, B>(client: C, backend: B, metrics: &ConnectionMetrics)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = io::split(client);
    let (backend_read, backend_write) = io::split(backend);

    let upstream = pipe(client_read, backend_write, |n| metrics.add_received(n));
    let downstream = pipe(backend_read, client_write, |n| metrics.add_sent(n));

    let (up, down) = tokio::join!(upstream, downstream);
    if let Err(e) = up {
        debug!("Client to backend copy ended: {}", e);
    }
    if let Err(e) = down {
        debug!("Backend to client copy ended: {}", e);
    }
}

/// Copy until EOF or error, then half-close the writer
async fn pipe<R, W, F>(mut reader: R, mut writer: W, on_bytes: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(usize),
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        on_bytes(n);
        total += n as u64;
    };

    // Propagate EOF to the peer; errors here mean it is already gone
    let _ = writer.shutdown().await;
    result
}

async fn dial(addr: &str) -> Result<TcpStream, ProxyError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ProxyError::BackendDial {
            addr: addr.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn metrics() -> ConnectionMetrics {
        ConnectionMetrics::new("a.example", SocketAddr::from(([127, 0, 0, 1], 40000)))
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_open() {
        let (client, mut client_peer) = io::duplex(1024);
        let (backend, mut backend_peer) = io::duplex(1024);
        let metrics = metrics();

        let proxy = async {
            proxy_bidirectional(client, backend, &metrics).await;
        };

        let peers = async {
            client_peer.write_all(b"request").await.unwrap();
            client_peer.shutdown().await.unwrap();

            let mut got = Vec::new();
            backend_peer.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, b"request");

            // Client's write side is closed; the response still gets through
            backend_peer.write_all(b"response").await.unwrap();
            backend_peer.shutdown().await.unwrap();

            let mut got = Vec::new();
            client_peer.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, b"response");
        };

        tokio::join!(proxy, peers);
        assert_eq!(metrics.bytes_received(), 7);
        assert_eq!(metrics.bytes_sent(), 8);
    }

    #[tokio::test]
    async fn test_pipe_counts_and_shuts_down_writer() {
        let reader = tokio_test::io::Builder::new()
            .read(b"abc")
            .read(b"defg")
            .build();
        let (writer, mut far) = io::duplex(64);

        let total = pipe(reader, writer, |_| {}).await.unwrap();
        assert_eq!(total, 7);

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"abcdefg");
    }

    #[tokio::test]
    async fn test_dial_failure() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (client, _peer) = io::duplex(64);

        let result = passthrough(client, &addr.to_string(), &metrics()).await;
        assert!(matches!(result, Err(ProxyError::BackendDial { .. })));
    }
}
