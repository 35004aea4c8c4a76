//! pricing-e2e -- end-to-end test orchestration for the multi-region pricing application.
//!
//! This crate drives browser test suites against remote environments, supervises
//! ssh tunnels and remote workflow triggers, classifies outcomes from captured logs,
//! and keeps a queryable execution history behind a small dashboard API.

pub mod api;
pub mod classify;
pub mod config;
pub mod executor;
pub mod orchestrator;
pub mod remote;
pub mod storage;
pub mod system;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::HarnessConfig;
use crate::orchestrator::Orchestrator;

/// Start the dashboard API. Fails if the history store cannot be initialized.
pub async fn serve(config: Arc<HarnessConfig>, bind: &str) -> Result<()> {
    // 1. Initialize storage
    let orchestrator = Arc::new(Orchestrator::open(Arc::clone(&config))?);

    // 2. Start API server
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", bind))?;
    let app = api::router(api::state::AppState::new(orchestrator));

    tracing::info!(%addr, logs_dir = %config.paths.logs_dir().display(), "pricing-e2e dashboard listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
