use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use gleaner_client::HttpFetcher;
use gleaner_core::{DedupStore, OrchestratorConfig};
use gleaner_db::{Database, DatabaseConfig};
use gleaner_server::routes;
use gleaner_server::state::AppState;

/// Job configurations are small; anything larger is a mistake.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gleaner=info".parse()?))
        .with_target(false)
        .init();

    let api_key =
        std::env::var("GLEANER_SERVER_API_KEY").context("GLEANER_SERVER_API_KEY must be set")?;
    let port = std::env::var("GLEANER_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;

    let dedup = match std::env::var("GLEANER_DEDUP_FILE") {
        Ok(path) => DedupStore::open(path).await?,
        Err(_) => DedupStore::new(),
    };
    tracing::info!(fingerprints = dedup.len(), "Dedup store ready");

    let mut engine = OrchestratorConfig::default();
    if let Ok(secs) = std::env::var("GLEANER_JOB_RETENTION_SECS") {
        let secs: u64 = secs
            .parse()
            .context("GLEANER_JOB_RETENTION_SECS must be a whole number of seconds")?;
        engine = engine.with_job_retention(Duration::from_secs(secs));
    }

    let state = Arc::new(AppState::new(
        db,
        api_key,
        HttpFetcher::new(),
        Arc::new(dedup),
        engine,
    ));

    let app = routes::router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
