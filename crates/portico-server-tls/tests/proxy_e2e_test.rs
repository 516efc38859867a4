//! End-to-end tests for the public TLS port
//!
//! Each test starts a relay on 127.0.0.1:0 with an in-memory tunnel store and
//! local backends, then drives it with real TCP and TLS clients:
//! 1. Passthrough tunnels see the client's bytes untouched, with half-close
//! 2. server-tls tunnels see a fresh TLS session from the relay
//! 3. Admin-domain and unknown hosts land in the injectable listener
//! 4. Garbage, unreachable or non-TLS backends and a closed local listener
//!    just close the client

use portico_cert::{
    backend_client_config, generate_self_signed_cert, server_config, BackendVerification,
    SelfSignedProvider, StaticCertificateProvider,
};
use portico_proto::{TlsTermination, Tunnel};
use portico_router::{HandoffReason, TunnelRegistry, TunnelRouter, TunnelStore};
use portico_server_tls::{InjectableListener, TlsServer, TlsServerConfig};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_relay(store: Arc<TunnelStore>) -> (SocketAddr, InjectableListener) {
    let (listener, injector) = InjectableListener::new();
    let config = TlsServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        backend_host: "127.0.0.1".to_string(),
    };
    let server = TlsServer::new(
        config,
        TunnelRouter::new(store),
        injector,
        Arc::new(SelfSignedProvider::new()),
        BackendVerification::AcceptAny,
    )
    .unwrap();

    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(socket).await;
    });

    (addr, listener)
}

fn client_hello(server_name: &str) -> Vec<u8> {
    let config = backend_client_config(BackendVerification::AcceptAny).unwrap();
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    let mut conn = rustls::ClientConnection::new(config, name).unwrap();
    let mut out = Vec::new();
    conn.write_tls(&mut out).unwrap();
    out
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// True once the peer has closed or reset the connection
async fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(
        timeout(TEST_TIMEOUT, stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

#[tokio::test]
async fn test_passthrough_forwards_bytes_and_half_close() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();

    let store = Arc::new(TunnelStore::new());
    store.upsert(Tunnel::new(
        "raw.example",
        backend_port,
        TlsTermination::Passthrough,
    ));
    let (relay_addr, _listener) = start_relay(store).await;

    let hello = client_hello("raw.example");
    let mut expected = hello.clone();
    expected.extend_from_slice(b"after hello");

    let backend_task = tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let mut received = Vec::new();
        // Completes only once the client's half-close is propagated
        socket.read_to_end(&mut received).await.unwrap();
        socket.write_all(b"bye").await.unwrap();
        socket.shutdown().await.unwrap();
        received
    });

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(&hello).await.unwrap();
    client.write_all(b"after hello").await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"bye");

    let received = timeout(TEST_TIMEOUT, backend_task).await.unwrap().unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_server_tls_tunnel_is_reencrypted() {
    let backend_cert = generate_self_signed_cert(&["secure.example".to_string()]).unwrap();
    let backend_cert_der = backend_cert.cert_chain[0].clone();
    let backend_provider = Arc::new(StaticCertificateProvider::new(backend_cert).unwrap());
    let backend_acceptor =
        TlsAcceptor::from(server_config(backend_provider, "secure.example", vec![]).unwrap());

    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();

    let store = Arc::new(TunnelStore::new());
    store.upsert(Tunnel::new(
        "secure.example",
        backend_port,
        TlsTermination::ServerTls,
    ));
    let (relay_addr, _listener) = start_relay(store).await;

    let backend_task = tokio::spawn(async move {
        let (socket, _) = backend.accept().await.unwrap();
        // A TLS handshake succeeds, so the relay speaks TLS to the backend
        let mut tls = backend_acceptor.accept(socket).await.unwrap();
        let sni = tls.get_ref().1.server_name().map(str::to_string);

        let mut request = [0u8; 6];
        tls.read_exact(&mut request).await.unwrap();
        tls.write_all(b"echo: ").await.unwrap();
        tls.write_all(&request).await.unwrap();
        tls.shutdown().await.unwrap();
        sni
    });

    let connector =
        TlsConnector::from(backend_client_config(BackendVerification::AcceptAny).unwrap());
    let socket = TcpStream::connect(relay_addr).await.unwrap();
    let mut client = timeout(
        TEST_TIMEOUT,
        connector.connect(ServerName::try_from("secure.example").unwrap(), socket),
    )
    .await
    .unwrap()
    .unwrap();

    // The client sees the relay's certificate, not the backend's
    let client_seen = client.get_ref().1.peer_certificates().unwrap()[0].clone();
    assert_ne!(client_seen, backend_cert_der);

    client.write_all(b"hello\n").await.unwrap();
    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"echo: hello\n");

    let sni = timeout(TEST_TIMEOUT, backend_task).await.unwrap().unwrap();
    assert_eq!(sni.as_deref(), Some("secure.example"));
}

#[tokio::test]
async fn test_admin_domain_is_handed_off_even_with_tunnel() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();

    let store = Arc::new(TunnelStore::new());
    store.set_admin_domain("admin.example".to_string());
    store.upsert(Tunnel::new(
        "admin.example",
        backend_port,
        TlsTermination::Passthrough,
    ));
    let (relay_addr, listener) = start_relay(store).await;

    let hello = client_hello("admin.example");
    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(&hello).await.unwrap();

    let conn = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.reason, HandoffReason::AdminDomain);
    assert_eq!(conn.stream.server_name(), "admin.example");
    assert_eq!(conn.stream.buffered(), &hello[..]);

    assert!(
        timeout(Duration::from_millis(200), backend.accept())
            .await
            .is_err(),
        "backend must not be contacted for the admin domain"
    );
}

#[tokio::test]
async fn test_unregistered_host_is_handed_off() {
    let store = Arc::new(TunnelStore::new());
    store.set_admin_domain("admin.example".to_string());
    let (relay_addr, listener) = start_relay(store).await;

    let hello = client_hello("nobody.example");
    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(&hello).await.unwrap();

    let mut conn = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.reason, HandoffReason::NoTunnel);
    assert_eq!(conn.stream.server_name(), "nobody.example");

    // The handed-off stream replays the ClientHello, then live bytes
    client.write_all(b"live").await.unwrap();
    let mut replayed = vec![0u8; hello.len() + 4];
    conn.stream.read_exact(&mut replayed).await.unwrap();
    assert_eq!(&replayed[..hello.len()], &hello[..]);
    assert_eq!(&replayed[hello.len()..], b"live");
}

#[tokio::test]
async fn test_non_tls_bytes_are_rejected() {
    let store = Arc::new(TunnelStore::new());
    let (relay_addr, listener) = start_relay(store).await;

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    assert!(is_closed(&mut client).await);
    assert!(timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn test_unreachable_backend_closes_client() {
    let store = Arc::new(TunnelStore::new());
    store.upsert(Tunnel::new(
        "down.example",
        unused_port().await,
        TlsTermination::Passthrough,
    ));
    store.upsert(Tunnel::new(
        "down-tls.example",
        unused_port().await,
        TlsTermination::ServerTls,
    ));
    let (relay_addr, _listener) = start_relay(store).await;

    for host in ["down.example", "down-tls.example"] {
        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(&client_hello(host)).await.unwrap();
        assert!(is_closed(&mut client).await, "{} stayed open", host);
    }
}

#[tokio::test]
async fn test_backend_tls_failure_closes_client() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();

    let store = Arc::new(TunnelStore::new());
    store.upsert(Tunnel::new(
        "plain.example",
        backend_port,
        TlsTermination::ServerTls,
    ));
    let (relay_addr, _listener) = start_relay(store).await;

    // Accepts TCP but answers the relay's ClientHello with plain HTTP
    let backend_task = tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let mut first = [0u8; 1];
        socket.read_exact(&mut first).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
        first[0]
    });

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client
        .write_all(&client_hello("plain.example"))
        .await
        .unwrap();
    assert!(is_closed(&mut client).await);

    let first = timeout(TEST_TIMEOUT, backend_task).await.unwrap().unwrap();
    assert_eq!(first, 0x16, "relay must open TLS toward the backend");
}

#[tokio::test]
async fn test_closed_local_listener_drops_handed_off_connection() {
    let store = Arc::new(TunnelStore::new());
    store.set_admin_domain("admin.example".to_string());
    let (relay_addr, listener) = start_relay(store).await;
    listener.close();

    for host in ["admin.example", "nobody.example"] {
        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(&client_hello(host)).await.unwrap();
        assert!(is_closed(&mut client).await, "{} stayed open", host);
    }
    assert!(listener.accept().await.is_err());
}
