//! Terminal broker CLI entry point.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:8080, no TLS, no WebSocket origins allowed)
//! broker-server serve
//!
//! # Bind multiple listeners and allow a browser origin over WebSocket
//! broker-server serve --listen 0.0.0.0:8080 --listen [::]:8080 \
//!     --allowed-origins https://console.example.com
//!
//! # Terminate TLS in-process with a self-signed certificate (dev only)
//! broker-server serve --tls-ephemeral
//! ```
//!
//! # Environment Variables
//!
//! - `PORT`: default bind port when `--listen` is not given (default: `8080`)
//! - `RUST_LOG`: logging level, overridden by `--log-level`

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use broker_transport::mux::{self, OriginPredicate};
use broker_transport::server::{GrpcServer, TlsConfig};

#[derive(Parser)]
#[command(name = "broker-server", version, about = "Terminal multiplexing rendezvous broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker listener until interrupted.
    Serve(ServeArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Address to listen on. May be repeated to bind multiple addresses.
    /// Defaults to the `PORT` environment variable on `0.0.0.0`, or 8080.
    #[arg(long = "listen")]
    listen: Vec<SocketAddr>,

    /// PEM-encoded TLS certificate chain file.
    #[arg(long = "tls-cert-file", requires = "tls_key_file")]
    tls_cert_file: Option<std::path::PathBuf>,

    /// PEM-encoded TLS private key file.
    #[arg(long = "tls-key-file", requires = "tls_cert_file")]
    tls_key_file: Option<std::path::PathBuf>,

    /// Generate an ephemeral self-signed certificate instead of reading one
    /// from disk. Intended for local development only.
    #[arg(long = "tls-ephemeral", conflicts_with_all = ["tls_cert_file", "tls_key_file"])]
    tls_ephemeral: bool,

    /// Comma-separated list of origins allowed to open a WebSocket guest
    /// channel. Every origin is denied when this is omitted.
    #[arg(long = "allowed-origins", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Overrides `RUST_LOG` for this process.
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let Command::Serve(args) = cli.command;

    broker_transport::init_tracing(args.log_level.as_deref());

    let shutdown = CancellationToken::new();
    let shutdown_for_handler = shutdown.clone();
    let already_shutting_down = Arc::new(AtomicBool::new(false));

    ctrlc::set_handler(move || {
        if already_shutting_down.swap(true, Ordering::SeqCst) {
            info!("second interrupt received, exiting immediately");
            std::process::exit(1);
        }
        info!("interrupt received, shutting down gracefully");
        shutdown_for_handler.cancel();
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("broker-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown))
}

async fn async_main(args: ServeArgs, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    info!(version = env!("CARGO_PKG_VERSION"), "terminal broker starting");

    let listen_addrs = resolve_listen_addrs(&args.listen)?;
    let origin_allowed = resolve_origin_predicate(&args.allowed_origins);
    let tls = resolve_tls(&args).await?;

    info!(
        listeners = ?listen_addrs,
        tls = tls.is_some(),
        allowed_origins = args.allowed_origins.len(),
        "configuration loaded"
    );

    let server = GrpcServer::new(shutdown, origin_allowed, tls)?;

    match server.serve_many(listen_addrs).await {
        Ok(()) => {
            info!("terminal broker shut down gracefully");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "terminal broker exited with an error");
            Err(err)
        }
    }
}

fn resolve_listen_addrs(listen: &[SocketAddr]) -> Result<Vec<SocketAddr>, Box<dyn std::error::Error>> {
    if !listen.is_empty() {
        return Ok(listen.to_vec());
    }

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(8080);

    Ok(vec![SocketAddr::from(([0, 0, 0, 0], port))])
}

fn resolve_origin_predicate(allowed_origins: &[String]) -> OriginPredicate {
    if allowed_origins.is_empty() {
        mux::deny_all()
    } else {
        mux::allow_list(allowed_origins.to_vec())
    }
}

async fn resolve_tls(args: &ServeArgs) -> Result<Option<TlsConfig>, Box<dyn std::error::Error>> {
    if args.tls_ephemeral {
        info!("generating ephemeral self-signed TLS certificate");
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        return Ok(Some(TlsConfig {
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
        }));
    }

    match (&args.tls_cert_file, &args.tls_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path)?;
            let key_pem = std::fs::read(key_path)?;
            Ok(Some(TlsConfig { cert_pem, key_pem }))
        }
        _ => Ok(None),
    }
}
