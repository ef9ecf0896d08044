//! Fleet agent binary.
//!
//! Registers with the controller, then heartbeats and polls for tasks until
//! the process exits. Pipeline configurations are materialized under
//! `PIPELAB_PIPELINE_DIR` by the default executor.
//!
//! # Environment Variables
//!
//! - `PIPELAB_CONTROLLER_URL` — controller base URL (default: http://127.0.0.1:8080)
//! - `PIPELAB_HOST_ID` — stable fleet identity (default: agent-local)
//! - `PIPELAB_HOSTNAME` — reported hostname
//! - `PIPELAB_POLL_INTERVAL` / `PIPELAB_HEARTBEAT_INTERVAL` — seconds
//! - `PIPELAB_PIPELINE_DIR` — where deployed configs land
//! - `RUST_LOG` — tracing filter (default: "info,pipelab=debug")

use std::sync::Arc;

use pipelab::agent::{AgentRunner, PipelineExecutor};
use pipelab::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pipelab=debug".into()),
        )
        .init();

    let config = AgentConfig::from_env();
    tracing::info!(
        host_id = %config.host_id,
        controller = %config.controller_url,
        "pipelab agent starting"
    );

    let executor = Arc::new(PipelineExecutor::new(config.pipeline_dir.clone()));
    let runner = AgentRunner::new(config, executor);
    runner.run().await?;
    Ok(())
}
