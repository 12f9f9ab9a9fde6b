use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use server::config::ServerConfig;
use server::engine::HttpSpeechEngine;
use server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting narration server...");

    let config = ServerConfig::from_env();
    let engine_url = config
        .engine_url
        .clone()
        .context("TTS_ENGINE_URL must point at a speech engine")?;
    let engine = HttpSpeechEngine::new(&engine_url, config.engine_timeout())?;
    info!("Using speech engine at {}", engine_url);

    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, sample_rate={}, flush={}s, carry_partial_samples={}",
        config.port,
        config.rate_limit_per_minute,
        config.sample_rate,
        config.flush_secs,
        config.carry_partial_samples
    );

    let state = AppState::new(Arc::new(engine), config.clone());
    let app = build_router(state)?;

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
