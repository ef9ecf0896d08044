//! Domain types persisted by the store and exchanged over the HTTP API.
//!
//! Status/phase enums carry a stable TEXT encoding (`as_str`/`parse`) used
//! both for the SQLite columns and the JSON wire format. Pipeline and task
//! payloads are opaque `serde_json::Value` blobs; the controller never
//! interprets them beyond shape checks at the API boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

/// Lifecycle phase of an experiment.
///
/// Transitions are monotonic: `pending → deploying → running → analyzing →
/// {completed | failed}`, with `rolled_back` reachable from `deploying`,
/// `running`, or `analyzing` via an explicit rollback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentPhase {
    Pending,
    Deploying,
    Running,
    Analyzing,
    Completed,
    Failed,
    RolledBack,
}

impl ExperimentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "deploying" => Some(Self::Deploying),
            "running" => Some(Self::Running),
            "analyzing" => Some(Self::Analyzing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Terminal phases admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Phases from which an explicit rollback request is honored.
    pub fn can_rollback(&self) -> bool {
        matches!(self, Self::Deploying | Self::Running | Self::Analyzing)
    }
}

/// A timed A/B comparison of a baseline and candidate telemetry pipeline
/// across a fixed set of hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    pub phase: ExperimentPhase,
    /// Opaque baseline pipeline configuration.
    pub baseline_pipeline: Value,
    /// Opaque candidate pipeline configuration.
    pub candidate_pipeline: Value,
    /// Target host set, fixed at creation.
    pub target_hosts: Vec<String>,
    /// Collection window after warmup, in seconds.
    pub duration_secs: i64,
    /// Settling time after deploy before collection counts, in seconds.
    pub warmup_secs: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Reconciliation ticks spent retrying aggregation while analyzing.
    pub analysis_attempts: i64,
    /// Cached cost-analysis result, set when aggregation succeeds.
    pub cost_analysis: Option<Value>,
}

impl Experiment {
    /// Wall-clock instant at which the collection window ends.
    pub fn collection_deadline(&self) -> Option<DateTime<Utc>> {
        self.started_at
            .map(|t| t + chrono::Duration::seconds(self.warmup_secs + self.duration_secs))
    }
}

/// Request body for experiment creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExperiment {
    pub name: String,
    pub baseline_pipeline: Value,
    pub candidate_pipeline: Value,
    pub target_hosts: Vec<String>,
    pub duration_secs: i64,
    #[serde(default)]
    pub warmup_secs: i64,
}

// ---------------------------------------------------------------------------
// Variant
// ---------------------------------------------------------------------------

/// Which side of the comparison a task, deployment, or sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Candidate,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::Baseline, Variant::Candidate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Candidate => "candidate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "baseline" => Some(Self::Baseline),
            "candidate" => Some(Self::Candidate),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// What the agent is asked to do with the task's config payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Deploy,
    Collect,
    Rollback,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Collect => "collect",
            Self::Rollback => "rollback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploy" => Some(Self::Deploy),
            "collect" => Some(Self::Collect),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// Task status. Transitions strictly forward:
/// `pending → assigned → running → {completed | failed}`, with requeue
/// (back to `pending`, retry_count + 1) as the only sanctioned reversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Priority given to rollback tasks so they jump every queue.
pub const ROLLBACK_PRIORITY: i64 = 100;

/// A unit of work assigned to exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Target agent.
    pub host_id: String,
    /// Owning experiment; `None` for agent-maintenance tasks.
    pub experiment_id: Option<Uuid>,
    pub action: TaskAction,
    pub variant: Option<Variant>,
    /// Opaque execution payload, validated only at the agent boundary.
    pub config: Value,
    pub priority: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: i64,
}

/// Parameters for task creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub host_id: String,
    pub experiment_id: Option<Uuid>,
    pub action: TaskAction,
    pub variant: Option<Variant>,
    pub config: Value,
    #[serde(default)]
    pub priority: i64,
}

/// A result or failure reported by the executing agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// A fleet-resident process that executes tasks and reports heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub host_id: String,
    pub hostname: String,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capabilities: Vec<String>,
    pub resource_usage: Value,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Eligible for new task assignment while healthy and within the
    /// heartbeat window.
    pub fn is_eligible(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        if self.status == AgentStatus::Unhealthy {
            return false;
        }
        match self.last_heartbeat {
            Some(t) => now - t < heartbeat_timeout,
            None => false,
        }
    }
}

/// Registration request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub host_id: String,
    pub hostname: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Heartbeat request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: AgentStatus,
    #[serde(default)]
    pub resource_usage: Value,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// One cached metric sample. Append-only; never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub experiment_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub metric_name: String,
    pub variant: Variant,
    pub host_id: String,
    pub value: f64,
    /// Label set; canonicalized (sorted keys) before storage so distinct
    /// label-set counting can run in SQL.
    pub labels: Value,
}

/// One sample inside a metric push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushedSample {
    pub metric_name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: Value,
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Body of `POST /api/v1/agents/{id}/metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPush {
    pub experiment_id: Uuid,
    pub variant: Variant,
    pub samples: Vec<PushedSample>,
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deploying,
    Active,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploying => "deploying",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploying" => Some(Self::Deploying),
            "active" => Some(Self::Active),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One pipeline deployment per (experiment, variant, host) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDeployment {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub name: String,
    pub namespace: String,
    pub pipeline: Value,
    pub variant: Variant,
    pub host_id: String,
    pub status: DeploymentStatus,
    pub metrics: Value,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Append-only audit/notification record. `seq` increases monotonically per
/// experiment and is the replay cursor for WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub phase: ExperimentPhase,
    pub message: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}
