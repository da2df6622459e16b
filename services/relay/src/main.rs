//! cloudterm relay server
//!
//! Exposes the terminal WebSocket bridge and the machine provisioning API.

use std::sync::Arc;

use anyhow::Result;
use cloudterm_provision::{DigitalOceanFactory, Launcher};
use cloudterm_relay::{api, bridge::SessionManager, config, ssh::SshConnector, state::AppState};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to CLOUDTERM_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cloudterm relay");
    info!(
        listen_addr = %config.listen_addr,
        provider_url = %config.provider_url,
        ssh_port = config.ssh_port,
        "Configuration loaded"
    );

    let connector = Arc::new(SshConnector::new(
        config.ssh_term.clone(),
        Some(std::time::Duration::from_secs(30)),
    ));
    let sessions = SessionManager::new(connector, config.bridge());

    let providers = Arc::new(DigitalOceanFactory::new(config.provider_url.clone())?);
    let launcher = Launcher::new(providers, config.poll_policy());

    let state = AppState::new(sessions.clone(), launcher);
    let app = api::create_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // Open WebSockets keep graceful shutdown waiting; closing the sessions
    // ends their sockets.
    info!("Closing shell sessions");
    sessions.close_all().await;

    info!("Relay shutdown complete");
    Ok(())
}
