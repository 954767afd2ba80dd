//! Rendezvous service
//!
//! Configure with `PORT` / `BIND_HOST` (or a `.env` file), logs via `RUST_LOG`.

use roomdrop_core::config::ServerConfig;
use roomdrop_core::rendezvous::start_server;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            shutdown.cancel();
        }
    });

    if let Err(e) = start_server(config.bind_addr, Some(cancel)).await {
        tracing::error!("Server error: {:#}", e);
        return Err(e);
    }
    Ok(())
}
