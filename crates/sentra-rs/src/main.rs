mod api;
mod broadcast;
mod config;
mod db;
mod engine;
mod models;
mod oracle;
mod parser;
mod remediation;
mod risk;
mod security;
mod stream;
mod tools;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    broadcast::BroadcastHub,
    config::AppConfig,
    db::SqliteScanStore,
    engine::{EngineSettings, ScanEngine},
    oracle::{Advisor, OpenRouterClient},
    security::HttpOwnershipVerifier,
    tools::ToolRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: ScanEngine,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let pool = db::create_pool(&config.database_url)
        .await
        .context("failed to open database")?;
    db::run_migrations(&pool).await.context("failed to run migrations")?;

    let registry = ToolRegistry::from_config(&config.tools);
    let baseline = registry.describe_baseline();
    if !baseline.available {
        warn!(tool = %baseline.name, "baseline tool not found, scans will record an error line");
    }
    for tool in registry.catalog() {
        info!(tool = %tool.name, available = tool.available, "follow-up tool");
    }

    if config.oracle.api_key.trim().is_empty() {
        warn!("no oracle API key configured, deterministic fallbacks will be used");
    }
    let advisor = Advisor::new(Arc::new(
        OpenRouterClient::new(config.oracle.clone()).context("failed to build oracle client")?,
    ));
    let verifier = HttpOwnershipVerifier::from_config(&config)
        .context("failed to build verification client")?;

    let engine = ScanEngine::new(
        registry,
        BroadcastHub::default(),
        advisor,
        Arc::new(verifier),
        Arc::new(SqliteScanStore::new(pool)),
        EngineSettings::from_config(&config),
    );
    let interrupted = engine
        .recover_interrupted()
        .await
        .context("failed to recover interrupted scans")?;
    if interrupted > 0 {
        warn!(count = interrupted, "marked scans interrupted by the last shutdown as failed");
    }

    let app = api::router(AppState { engine })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "Sentra.AI listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
