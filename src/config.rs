//! Typed configuration for the controller and agent processes.
//!
//! All tunables are plain struct fields with defaults; `from_env()` overlays
//! environment variables so deployments can tune intervals without code
//! changes. Durations are kept as whole seconds, which is the resolution the
//! reconciliation loops operate at.

use std::path::PathBuf;
use std::time::Duration;

/// Controller-process configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Period of the experiment reconciliation tick.
    pub reconcile_interval_secs: u64,
    /// Period of the lease-expiry sweep.
    pub lease_sweep_interval_secs: u64,
    /// Maximum time a task may stay assigned/running without a result report
    /// before it is requeued.
    pub lease_timeout_secs: u64,
    /// An agent whose last heartbeat is older than this is ineligible for
    /// new assignments.
    pub heartbeat_timeout_secs: u64,
    /// Maximum requeues before a task is permanently failed.
    pub max_retries: i64,
    /// Maximum reconciliation ticks the analyzing phase may spend retrying
    /// aggregation before the experiment is failed.
    pub max_analysis_attempts: i64,
    /// Capacity of the live event broadcast channel.
    pub event_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("pipelab.db"),
            reconcile_interval_secs: 5,
            lease_sweep_interval_secs: 10,
            lease_timeout_secs: 120,
            heartbeat_timeout_secs: 60,
            max_retries: 3,
            max_analysis_attempts: 5,
            event_buffer: 1024,
        }
    }
}

impl ControllerConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_string("PIPELAB_BIND", d.bind_addr),
            db_path: PathBuf::from(env_string(
                "PIPELAB_DB",
                d.db_path.to_string_lossy().into_owned(),
            )),
            reconcile_interval_secs: env_u64("PIPELAB_RECONCILE_INTERVAL", d.reconcile_interval_secs),
            lease_sweep_interval_secs: env_u64("PIPELAB_LEASE_SWEEP_INTERVAL", d.lease_sweep_interval_secs),
            lease_timeout_secs: env_u64("PIPELAB_LEASE_TIMEOUT", d.lease_timeout_secs),
            heartbeat_timeout_secs: env_u64("PIPELAB_HEARTBEAT_TIMEOUT", d.heartbeat_timeout_secs),
            max_retries: env_u64("PIPELAB_MAX_RETRIES", d.max_retries as u64) as i64,
            max_analysis_attempts: env_u64("PIPELAB_MAX_ANALYSIS_ATTEMPTS", d.max_analysis_attempts as u64)
                as i64,
            event_buffer: env_u64("PIPELAB_EVENT_BUFFER", d.event_buffer as u64) as usize,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lease_sweep_interval_secs)
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_timeout_secs as i64)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }
}

/// Agent-process configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the controller, e.g. `http://controller:8080`.
    pub controller_url: String,
    /// Stable identity of this host within the fleet.
    pub host_id: String,
    /// Human-readable hostname reported at registration.
    pub hostname: String,
    /// Capability tags advertised at registration.
    pub capabilities: Vec<String>,
    /// Period between task polls.
    pub poll_interval_secs: u64,
    /// Period between heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Directory the agent materializes pipeline configurations into.
    pub pipeline_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            controller_url: "http://127.0.0.1:8080".to_string(),
            host_id: "agent-local".to_string(),
            hostname: "localhost".to_string(),
            capabilities: vec!["deploy".to_string(), "collect".to_string(), "rollback".to_string()],
            poll_interval_secs: 5,
            heartbeat_interval_secs: 15,
            pipeline_dir: PathBuf::from("/var/lib/pipelab/pipelines"),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            controller_url: env_string("PIPELAB_CONTROLLER_URL", d.controller_url),
            host_id: env_string("PIPELAB_HOST_ID", d.host_id),
            hostname: env_string("PIPELAB_HOSTNAME", d.hostname),
            capabilities: d.capabilities,
            poll_interval_secs: env_u64("PIPELAB_POLL_INTERVAL", d.poll_interval_secs),
            heartbeat_interval_secs: env_u64("PIPELAB_HEARTBEAT_INTERVAL", d.heartbeat_interval_secs),
            pipeline_dir: PathBuf::from(env_string(
                "PIPELAB_PIPELINE_DIR",
                d.pipeline_dir.to_string_lossy().into_owned(),
            )),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
