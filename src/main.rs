use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use whois_gateway::{Cli, GatewayConfig, WhoisServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::resolve(Cli::parse())?;
    info!(
        listen_addr = %config.listen,
        upstream = %config.upstream.template.as_str(),
        rate = %config.rate,
        headers = config.upstream.headers.len(),
        upstream_timeout = ?config.upstream.timeout,
        "Configuration loaded"
    );

    let server = Arc::new(WhoisServer::from_config(&config)?);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to listen; address={}", config.listen))?;

    info!(
        listen_addr = %listener.local_addr().context("Failed to get listener local address")?,
        "WHOIS gateway listening"
    );

    let serving = server.clone();
    let accept_loop = tokio::spawn(async move { serving.serve(listener).await });

    shutdown_signal().await?;

    info!("Closing listener and waiting for clients to finish");
    server.stop().await;
    accept_loop.await.context("Accept loop task failed")?;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for interrupt")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")
}
