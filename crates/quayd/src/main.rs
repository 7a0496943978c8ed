//! Quay Daemon - cluster topology and membership controller
//!
//! Usage:
//!   # Defaults: cluster traffic on 3301, admin API on 8081
//!   quayd
//!
//!   # Explicit identity and addresses
//!   quayd --advertise-uri storage-1.local:3302 \
//!     --alias storage-1 \
//!     --cluster-bind 0.0.0.0:3302 \
//!     --api-bind 0.0.0.0:8082

use clap::Parser;
use quay_cluster::{init_metrics, Controller};
use quayd::{start_admin_server, Cli};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    init_metrics(cli.metrics.then_some(cli.metrics_bind)).map_err(|e| anyhow::anyhow!(e))?;

    let controller = Controller::start(cli.to_controller_config()).await?;
    tracing::info!(
        uri = %controller.uri(),
        cluster = %controller.cluster_addr(),
        api = %cli.api_bind,
        "Quay instance started"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received, initiating graceful shutdown...");
        let _ = signal_tx.send(());
    });

    let mut api_shutdown = shutdown_tx.subscribe();
    let result = start_admin_server(cli.api_bind, controller.clone(), None, async move {
        let _ = api_shutdown.recv().await;
    })
    .await;

    controller.shutdown().await;
    if let Err(e) = &result {
        tracing::error!("Admin API server error: {}", e);
    }
    tracing::info!("Goodbye!");
    result
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
