//! `bridge-auth serve`: run the pairing HTTP server.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;
use tokio::sync::watch;

use crate::config::AuthConfig;
use crate::http;
use crate::pairing::{PairingService, spawn_autosave};

/// Shutdown budget for the final save.
const SHUTDOWN_SAVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1", env = "BRIDGE_AUTH_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "7878", env = "BRIDGE_AUTH_PORT")]
    pub port: u16,
}

/// Serve until Ctrl-C, then stop background tasks and save.
pub async fn run_serve_command(args: ServeArgs, config: AuthConfig) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (service, sweeper) = PairingService::start(config, shutdown_rx.clone()).await;
    let autosave = spawn_autosave(service.clone(), shutdown_rx);

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}:{}: {}", args.host, args.port, e))?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        storage = ?service.config().storage_path,
        "Pairing server listening"
    );

    let app = http::router(service.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown requested");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Sweeper task ended abnormally");
    }
    if let Err(e) = autosave.await {
        tracing::warn!(error = %e, "Autosave task ended abnormally");
    }

    service.save_with_timeout(SHUTDOWN_SAVE_TIMEOUT).await?;
    tracing::info!("Pairing server stopped");
    Ok(())
}
