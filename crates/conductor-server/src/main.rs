//! Conductor - shard-coordinated service node

use anyhow::{anyhow, Context};
use clap::Parser;
use conductor_server::{
    api,
    config::{split_endpoints, ShardingConfig},
    observability::{init_metrics, init_tracing, shutdown_tracing, TracingConfig},
    sharding::Coordinator,
    shutdown,
    store::{EtcdStore, KvStore},
    version,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Shard-coordinated conductor node")]
#[command(version = version::VERSION)]
struct Cli {
    /// HTTP API bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: String,

    /// etcd endpoints (comma-separated)
    #[arg(long, env = "ETCD_ENDPOINTS", default_value = "http://127.0.0.1:2379")]
    etcd_endpoints: String,

    /// Identity published in the membership record (host:port)
    #[arg(long, env = "CONDUCTOR_ADVERTISE_ADDR")]
    advertise_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(TracingConfig::from_env())
        .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))?;

    info!(version = %version::full_version(), "Starting conductor");

    let metrics_state = match init_metrics() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    };

    let mut config = ShardingConfig::from_env();
    config.etcd_endpoints = split_endpoints(&cli.etcd_endpoints);
    if let Some(addr) = cli.advertise_addr {
        config.advertise_addr = addr;
    }

    info!(
        endpoints = ?config.etcd_endpoints,
        advertise_addr = %config.advertise_addr,
        total_size = config.total_size,
        "Connecting to etcd"
    );
    let store: Arc<dyn KvStore> = Arc::new(
        EtcdStore::connect(&config)
            .await
            .context("etcd unreachable")?,
    );

    let coordinator = Coordinator::new(store.clone(), config);
    let (_cancel, cancel_signal) = shutdown::channel();
    coordinator.run(cancel_signal);

    let app = api::create_router(api::AppState {
        coordinator: coordinator.clone(),
        store,
        metrics_state,
    });

    info!(bind_addr = %cli.bind_addr, "Starting API server");
    let listener = tokio::net::TcpListener::bind(&cli.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind_addr))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_requested())
        .await;

    coordinator.stop().await;
    shutdown_tracing();

    served.context("API server failed")
}

async fn shutdown_requested() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown requested");
}
