use anyhow::Context;
use clap::Parser;
use metagrab_api::config::AppConfig;
use metagrab_api::state::build_state;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::parse();
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        mode = %config.default_mode(),
        "Starting metagrab"
    );

    let state = build_state(config.clone()).await?;
    let app = metagrab_api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    state.workers.shutdown().await;
    state.engine.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
