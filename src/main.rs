//! Portico relay
//!
//! Owns the public TLS port and routes every connection by SNI: raw
//! passthrough, TLS re-encryption toward the backend, or the relay's own
//! HTTPS stack (admin domain, unknown hosts, `server`-mode tunnels).

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use portico_cert::{
    load_certificate_from_files, BackendVerification, CertificateProvider, SelfSignedProvider,
    StaticCertificateProvider,
};
use portico_proto::RelayContext;
use portico_router::{TunnelRegistry, TunnelRouter, TunnelStore};
use portico_server_https::{
    local_router, LocalHttpsServer, LocalRouters, PlainHttpConfig, PlainHttpServer, ReverseProxy,
    BOOTSTRAP_CALLBACK_PATH,
};
use portico_server_tls::{InjectableListener, TlsServer, TlsServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Portico relay - routes public TLS connections to reverse tunnels
#[derive(Parser, Debug)]
#[command(name = "portico-relay")]
#[command(about = "Run the Portico reverse-tunnel relay", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Public TLS bind address (SNI routing)
    #[arg(long, env = "PORTICO_HTTPS_ADDR", default_value = "0.0.0.0:443")]
    https_addr: SocketAddr,

    /// Plain HTTP bind address (redirects to HTTPS unless --allow-http)
    #[arg(long, env = "PORTICO_HTTP_ADDR", default_value = "0.0.0.0:80")]
    http_addr: SocketAddr,

    /// Admin domain; overrides the value stored in the tunnels file
    #[arg(long, env = "PORTICO_ADMIN_DOMAIN")]
    admin_domain: Option<String>,

    /// Public IP address of this relay
    #[arg(long, env = "PORTICO_PUBLIC_IP", default_value = "127.0.0.1")]
    public_ip: String,

    /// Port of the SSH server tunnel clients connect to
    #[arg(long, env = "PORTICO_SSH_SERVER_PORT", default_value = "22")]
    ssh_server_port: u16,

    /// JSON file with the admin domain and registered tunnels
    #[arg(long, env = "PORTICO_TUNNELS")]
    tunnels: Option<PathBuf>,

    /// TLS certificate file path (PEM format)
    /// If not specified, self-signed certificates are generated per hostname
    #[arg(long, env = "PORTICO_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key file path (PEM format)
    #[arg(long, env = "PORTICO_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Host where tunnel backend ports are reachable
    #[arg(long, env = "PORTICO_BACKEND_HOST", default_value = "localhost")]
    backend_host: String,

    /// Verify certificates of server-tls backends against the web PKI
    #[arg(long, env = "PORTICO_BACKEND_TLS_VERIFY")]
    backend_tls_verify: bool,

    /// Serve the local router on the HTTP port instead of redirecting
    #[arg(long, env = "PORTICO_ALLOW_HTTP")]
    allow_http: bool,

    /// Trust and extend X-Forwarded-For from an upstream proxy
    #[arg(long, env = "PORTICO_BEHIND_PROXY")]
    behind_proxy: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PORTICO_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    /// Certificates can only be issued automatically on the standard ports
    fn auto_certs(&self) -> bool {
        self.https_addr.port() == 443 && self.http_addr.port() == 80
    }

    fn backend_verification(&self) -> BackendVerification {
        if self.backend_tls_verify {
            BackendVerification::WebPki
        } else {
            BackendVerification::AcceptAny
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_logging(&args.log_level)?;

    info!("Starting Portico relay");

    let registry = Arc::new(match &args.tunnels {
        Some(path) => TunnelStore::load_from_file(path)
            .with_context(|| format!("Failed to load tunnels from {}", path.display()))?,
        None => TunnelStore::new(),
    });
    if let Some(domain) = &args.admin_domain {
        registry.set_admin_domain(domain.clone());
    }
    let admin_domain = registry.admin_domain();
    if admin_domain.is_empty() {
        warn!("No admin domain configured; the admin API is unreachable");
    } else {
        info!("Admin domain: {}", admin_domain);
    }
    info!("Loaded {} tunnel(s)", registry.len());

    let context = Arc::new(RelayContext::new(
        args.ssh_server_port,
        args.public_ip.clone(),
        args.auto_certs(),
    ));

    let fallback_name = if admin_domain.is_empty() {
        "localhost".to_string()
    } else {
        admin_domain.clone()
    };

    let certificates: Arc<dyn CertificateProvider> = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let certificate = load_certificate_from_files(cert, key)
                .context("Failed to load TLS certificate")?;
            Arc::new(StaticCertificateProvider::new(certificate)?)
        }
        _ => {
            info!("No TLS certificate given; generating self-signed certificates per hostname");
            Arc::new(self_signed_provider(registry.clone(), &fallback_name))
        }
    };

    let routers = LocalRouters {
        bootstrap: bootstrap_router(),
        admin_api: admin_api_router(context.clone(), registry.clone()),
        admin_ui: admin_ui_router(),
    };
    let app = local_router(
        registry.clone(),
        routers,
        ReverseProxy::new(args.backend_host.clone(), args.behind_proxy),
    );

    let (listener, injector) = InjectableListener::new();
    let listener = listener.with_local_addr(args.https_addr);
    let https = LocalHttpsServer::new(listener, certificates.clone(), &fallback_name, app.clone())?;

    let tls = TlsServer::new(
        TlsServerConfig {
            bind_addr: args.https_addr,
            backend_host: args.backend_host.clone(),
        },
        TunnelRouter::new(registry.clone()),
        injector,
        certificates,
        args.backend_verification(),
    )?;

    let plain = PlainHttpServer::new(
        PlainHttpConfig {
            bind_addr: args.http_addr,
            https_port: args.https_addr.port(),
            allow_http: args.allow_http,
        },
        app,
    );

    let https_handle = tokio::spawn(https.run());
    let mut tls_handle = tokio::spawn(async move { tls.start().await });
    let mut http_handle = tokio::spawn(async move { plain.start().await });

    info!("Portico relay is running");
    info!("  - TLS (SNI routing): {}", args.https_addr);
    info!("  - HTTP: {}", args.http_addr);
    info!("Press Ctrl+C to stop");

    let outcome = tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping servers..."),
                Err(err) => error!("Error listening for shutdown signal: {}", err),
            }
            Ok(())
        }
        result = &mut tls_handle => Err(server_exit("TLS server", result)),
        result = &mut http_handle => Err(server_exit("HTTP server", result)),
    };

    tls_handle.abort();
    http_handle.abort();
    https_handle.abort();
    info!("Portico relay stopped");

    outcome
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Describe why a server task ended before shutdown
fn server_exit<E>(name: &str, result: Result<Result<(), E>, JoinError>) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    match result {
        Ok(Ok(())) => anyhow!("{} stopped unexpectedly", name),
        Ok(Err(e)) => anyhow::Error::new(e).context(format!("{} failed", name)),
        Err(e) => anyhow::Error::new(e).context(format!("{} task panicked", name)),
    }
}

/// Self-signed certificates only for names the relay terminates TLS for;
/// every other SNI shares the fallback certificate
fn self_signed_provider(registry: Arc<TunnelStore>, fallback_name: &str) -> SelfSignedProvider {
    let router = TunnelRouter::new(registry);
    SelfSignedProvider::new().serving_only(fallback_name, move |name| router.terminates_tls(name))
}

#[derive(Clone)]
struct AdminState {
    context: Arc<RelayContext>,
    registry: Arc<TunnelStore>,
}

/// Stand-in for the admin REST API; serves `/api/status`
fn admin_api_router(context: Arc<RelayContext>, registry: Arc<TunnelStore>) -> Router {
    Router::new()
        .route("/status", get(status))
        .with_state(AdminState { context, registry })
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("GIT_TAG"),
        "admin_domain": state.registry.admin_domain(),
        "tunnels": state.registry.len(),
        "address_record_type": state.context.address_record_type(),
        "context": state.context.as_ref(),
    }))
}

fn admin_ui_router() -> Router {
    Router::new().fallback(|| async {
        (
            StatusCode::NOT_IMPLEMENTED,
            "The admin web UI is not bundled with this relay; use /api/status",
        )
    })
}

fn bootstrap_router() -> Router {
    Router::new().route(
        BOOTSTRAP_CALLBACK_PATH,
        get(|| async {
            (
                StatusCode::NOT_IMPLEMENTED,
                "Domain bootstrap is not configured on this relay",
            )
        }),
    )
}
