use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cuentas::commands;
use cuentas::config::AppConfig;
use cuentas::db::Database;
use cuentas::services::openai::{CompletionClient, OpenAiClient};
use cuentas::services::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cuentas=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;

    if let Some(parent) = config.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(&config.database_path)
        .with_context(|| format!("Failed to open database at {}", config.database_path.display()))?;

    if config.openai.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set; classification needs a per-owner key in settings");
    }
    let completion: Arc<dyn CompletionClient> = Arc::new(OpenAiClient::new(&config.openai));

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(db, config, completion);
    tokio::spawn(sweep_import_sessions(state.clone()));
    let app = commands::router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Periodically drops import sessions nobody has touched within the TTL.
async fn sweep_import_sessions(state: AppState) {
    let mut ticker = tokio::time::interval(state.config.import_session_ttl / 4);
    loop {
        ticker.tick().await;
        if let Err(e) = state.sweep_sessions(chrono::Utc::now()) {
            tracing::error!("Import session sweep failed: {}", e);
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
