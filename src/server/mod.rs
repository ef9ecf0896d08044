//! HTTP surface of the controller.
//!
//! Exposes the REST API consumed by the CLI/dashboard and fleet agents,
//! plus the `/ws` WebSocket stream of experiment events.
//!
//! # Endpoints
//!
//! - `GET  /health` — liveness probe
//! - `/api/v1/experiments...` — experiment lifecycle and analysis
//! - `/api/v1/agents...` — registration, heartbeat, task poll, metric push
//! - `/api/v1/fleet/status`, `/api/v1/pipelines...` — fleet and pipeline views
//! - `GET  /ws` — ordered event stream with store-backed replay

pub mod routes;
mod ws;

pub use routes::{app_router, AppState};
