//! # Pipelab
//!
//! Controller for observability-cost A/B experiments across a fleet of
//! telemetry-pipeline hosts.
//!
//! An **experiment** compares a baseline and a candidate pipeline
//! configuration on a fixed set of hosts. The controller drives each
//! experiment through a phase state machine by scheduling deploy/collect/
//! rollback **tasks** onto fleet **agents**, tracks agent liveness through
//! heartbeats, ingests pushed metric samples, and aggregates them into a
//! cardinality-reduction cost analysis. Live observers follow ordered
//! experiment events over a WebSocket stream with store-backed replay.

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod errors;
pub mod experiment;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod server;
pub mod store;

pub use broadcast::EventBroadcaster;
pub use config::{AgentConfig, ControllerConfig};
pub use experiment::ExperimentEngine;
pub use metrics::CostAnalysis;
pub use model::{AgentRecord, Experiment, ExperimentEvent, ExperimentPhase, Task, TaskStatus};
pub use scheduler::TaskScheduler;
pub use store::Store;

/// Library version reported by the `/health` endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
