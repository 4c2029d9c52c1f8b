//! storekeeper-server - store lifecycle control plane daemon.
//!
//! Startup order matters: tracing first, then configuration, then the
//! registry, then the listener, and only then the reconciler - recovery
//! runs with the API already answering so health checks see a live
//! process while mid-flight stores converge.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use storekeeper_core::helm::HelmClient;
use storekeeper_core::kubectl::KubectlClient;
use storekeeper_core::{Config, Reconciler, Registry};
use storekeeper_server::{api, AppState};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// storekeeper control plane
#[derive(Parser, Debug)]
#[command(name = "storekeeper-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// HTTP port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the SQLite database (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    info!(
        environment = %config.environment,
        db_path = %config.db_path.display(),
        base_domain = %config.base_domain,
        max_stores = config.max_stores,
        "starting storekeeper"
    );

    let registry =
        Registry::open(&config.db_path).context("failed to open the store registry")?;
    let deployer = Arc::new(HelmClient::from_config(&config));
    let inspector = Arc::new(KubectlClient::from_config(&config));

    let state = AppState::new(config.clone(), registry, deployer, inspector);
    let app = api::router(Arc::clone(&state));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "API listening");

    // Startup reconciliation: converge stores a previous process left
    // mid-flight. Runs after bind so the API answers during recovery.
    let reconciler = Reconciler::new(
        state.registry.clone(),
        Arc::clone(&state.inspector),
        Arc::clone(&state.engines),
    );
    tokio::spawn(async move {
        reconciler.run().await;
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("storekeeper stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
