//! Ferry proxy
//!
//! Accepts TCP connections and relays each one to a fixed remote endpoint,
//! optionally terminating TLS from clients and originating TLS to the remote.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ferry_core::config::{ClientTlsConfig, Config, load_config};
use ferry_core::tracing_init::{default_filter, init_tracing};
use ferry_proxy::tls::config::server_name;
use ferry_proxy::tls::{ClientTlsMode, RemoteTls};
use ferry_proxy::{LoggingObserver, ProxyServer, RemoteTarget, TransportObserver};

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version, about = "Ferry - bidirectional TCP relay with optional TLS on either leg")]
struct Args {
    /// Path to a JSON config file, merged over the global settings.
    #[arg(long, short, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Host every session connects to.
    #[arg(long)]
    remote_host: Option<String>,

    /// Port every session connects to.
    #[arg(long)]
    remote_port: Option<u16>,

    /// Serve clients over TLS with auto-generated self-signed certificates.
    #[arg(long, conflicts_with = "tls_cert")]
    dev_tls: bool,

    /// Path to TLS certificate file (PEM) presented to clients.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM).
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Connect to the remote over TLS.
    #[arg(long)]
    remote_tls: bool,

    /// CA certificate (PEM) used to verify the remote instead of the web PKI roots.
    #[arg(long, requires = "remote_tls")]
    remote_ca: Option<PathBuf>,

    /// Skip remote certificate verification. Development only.
    #[arg(long, requires = "remote_tls")]
    remote_insecure: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Command-line flags take precedence over every config source.
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.listen {
            config.listen.addr = addr;
        }
        if let Some(host) = self.remote_host {
            config.remote.host = host;
        }
        if let Some(port) = self.remote_port {
            config.remote.port = port;
        }
        if self.dev_tls {
            config.client_tls = ClientTlsConfig::DevSelfSigned { cert_dir: None };
        } else if let (Some(cert_path), Some(key_path)) = (self.tls_cert, self.tls_key) {
            config.client_tls = ClientTlsConfig::Custom {
                cert_path,
                key_path,
            };
        }
        if self.remote_tls {
            config.remote.tls.enabled = true;
        }
        if self.remote_ca.is_some() {
            config.remote.tls.ca_path = self.remote_ca;
        }
        if self.remote_insecure {
            config.remote.tls.insecure = true;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&default_filter(&config.logging.level), config.logging.json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen.addr,
        remote = %format_args!("{}:{}", config.remote.host, config.remote.port),
        "Starting ferry"
    );

    let logging = Arc::new(LoggingObserver::new());
    let mut transport = TransportObserver::new(logging);

    if let Some(acceptor) = ClientTlsMode::from_config(&config.client_tls).build_acceptor()? {
        info!("Client TLS enabled");
        transport = transport.with_client_tls(acceptor);
    }
    if let Some(remote_tls) = RemoteTls::from_config(&config.remote.tls) {
        let connector = remote_tls.build_connector()?;
        transport = transport.with_remote_tls(connector, server_name(&config.remote.host)?);
        info!(insecure = remote_tls.insecure, "Remote TLS enabled");
    }

    let target = RemoteTarget::new(config.remote.host.clone(), config.remote.port);
    let server = ProxyServer::bind(config.listen.addr, target, Arc::new(transport)).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    server.run(shutdown).await;
    Ok(())
}
