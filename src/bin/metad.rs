//! Development metadata authority
//!
//! Serves an in-memory metadata store over HTTP for local clusters and tests.

use metasync::api;
use metasync::meta::{Command, MemoryStore, StoreConfig};
use metasync::telemetry::Telemetry;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "METASYNC_BIND", default_value = "0.0.0.0:8091")]
    bind: SocketAddr,

    /// Seconds a snapshot request is held waiting for a newer index
    #[arg(long, env = "METASYNC_LONG_POLL_SECS", default_value = "10")]
    long_poll_secs: u64,

    /// Register this process as a meta node under this HTTP address
    #[arg(long, env = "METASYNC_ADVERTISE")]
    advertise: Option<String>,

    /// TCP address recorded with --advertise
    #[arg(long, env = "METASYNC_ADVERTISE_TCP", default_value = "")]
    advertise_tcp: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("metasync-metad", &args.log_level)?;

    let store = Arc::new(MemoryStore::new(StoreConfig {
        long_poll_timeout: Duration::from_secs(args.long_poll_secs),
    }));

    if let Some(http_addr) = args.advertise.clone() {
        let index = store.apply(Command::CreateMetaNode {
            http_addr: http_addr.clone(),
            tcp_addr: args.advertise_tcp.clone(),
        })?;
        info!(http_addr = %http_addr, index, "Registered meta node");
    }

    let listener = TcpListener::bind(args.bind).await?;
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    info!(
        bind = %args.bind,
        long_poll_secs = args.long_poll_secs,
        "Metadata authority ready"
    );
    api::serve(listener, store, shutdown).await?;
    info!("Metadata authority shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
