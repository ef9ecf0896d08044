//! Controller HTTP server binary.
//!
//! Opens the SQLite store, spawns the reconciliation and lease-sweep loops,
//! and serves the REST + WebSocket API.
//!
//! # Environment Variables
//!
//! - `PIPELAB_BIND` — bind address (default: 0.0.0.0:8080)
//! - `PIPELAB_DB` — SQLite database path (default: pipelab.db)
//! - `PIPELAB_RECONCILE_INTERVAL` / `PIPELAB_LEASE_SWEEP_INTERVAL` /
//!   `PIPELAB_LEASE_TIMEOUT` / `PIPELAB_HEARTBEAT_TIMEOUT` /
//!   `PIPELAB_MAX_RETRIES` / `PIPELAB_MAX_ANALYSIS_ATTEMPTS` — tunables, in
//!   whole seconds / counts
//! - `RUST_LOG` — tracing filter (default: "info,pipelab=debug")

use std::sync::Arc;

use anyhow::Context;
use pipelab::experiment::SystemClock;
use pipelab::server::{app_router, AppState};
use pipelab::{ControllerConfig, EventBroadcaster, ExperimentEngine, Store, TaskScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pipelab=debug".into()),
        )
        .init();

    let config = ControllerConfig::from_env();
    let store = Arc::new(
        Store::open(&config.db_path)
            .with_context(|| format!("opening store at {}", config.db_path.display()))?,
    );
    tracing::info!(
        db = %config.db_path.display(),
        schema_version = store.schema_version()?,
        "store opened"
    );

    let broadcaster = EventBroadcaster::new(config.event_buffer);
    let scheduler = Arc::new(TaskScheduler::new(store.clone(), &config));
    let engine = Arc::new(ExperimentEngine::new(
        store.clone(),
        scheduler.clone(),
        broadcaster.clone(),
        &config,
        Arc::new(SystemClock),
    ));

    tokio::spawn(engine.clone().run_reconciler(config.reconcile_interval()));
    tokio::spawn(
        scheduler
            .clone()
            .run_lease_sweeper(config.lease_sweep_interval()),
    );

    let state = AppState::new(store, scheduler, engine, broadcaster, config.clone());
    let app = app_router(state);

    tracing::info!("pipelab controller starting on {}", config.bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health              — liveness probe");
    tracing::info!("  *    /api/v1/experiments  — experiment lifecycle");
    tracing::info!("  *    /api/v1/agents       — agent protocol");
    tracing::info!("  GET  /api/v1/fleet/status — fleet health");
    tracing::info!("  GET  /ws                  — event stream");

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
