//! Fleet-side agent runtime.
//!
//! A long-lived process per host: registers with the controller, then
//! heartbeats, polls for tasks, and pushes metric samples on independent
//! schedules. Task execution is serialized — one in-flight task per poll —
//! and goes through the [`TaskExecutor`] trait; the controller treats the
//! actual deploy/collect/rollback work as opaque.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::model::{AgentRecord, AgentStatus, MetricPush, Task, TaskAction};

/// Executes a claimed task's opaque config.
///
/// Implementations must be idempotent per task id: the scheduler delivers
/// at-least-once, so a requeued task may be executed again.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<Value, String>;
}

/// Default executor: materializes pipeline configurations as files under
/// the agent's pipeline directory. The real collector reload is left to
/// host tooling watching that directory.
pub struct PipelineExecutor {
    dir: PathBuf,
}

impl PipelineExecutor {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, task: &Task) -> PathBuf {
        let experiment = task
            .experiment_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "adhoc".to_string());
        let variant = task
            .variant
            .map(|v| v.as_str())
            .unwrap_or("all");
        self.dir.join(format!("{experiment}-{variant}.json"))
    }
}

#[async_trait]
impl TaskExecutor for PipelineExecutor {
    async fn execute(&self, task: &Task) -> Result<Value, String> {
        match task.action {
            TaskAction::Deploy => {
                let pipeline = task
                    .config
                    .get("pipeline")
                    .ok_or_else(|| "deploy config missing 'pipeline'".to_string())?;
                let path = self.path_for(task);
                tokio::fs::create_dir_all(&self.dir)
                    .await
                    .map_err(|e| format!("create {}: {e}", self.dir.display()))?;
                let body = serde_json::to_vec_pretty(pipeline).map_err(|e| e.to_string())?;
                tokio::fs::write(&path, body)
                    .await
                    .map_err(|e| format!("write {}: {e}", path.display()))?;
                Ok(json!({"deployed": path}))
            }
            TaskAction::Collect => {
                let mut deployed = Vec::new();
                if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        deployed.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                Ok(json!({"deployed_pipelines": deployed}))
            }
            TaskAction::Rollback => {
                // Remove every config belonging to the experiment; a rerun
                // after partial removal finds nothing left and still succeeds.
                let experiment = task
                    .experiment_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "adhoc".to_string());
                let mut removed = Vec::new();
                if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if name.starts_with(&experiment) {
                            tokio::fs::remove_file(entry.path())
                                .await
                                .map_err(|e| format!("remove {name}: {e}"))?;
                            removed.push(name);
                        }
                    }
                }
                Ok(json!({"removed": removed}))
            }
        }
    }
}

#[derive(Deserialize)]
struct PollResponse {
    task: Option<Task>,
}

/// Drives the agent protocol against the controller's HTTP API.
#[derive(Clone)]
pub struct AgentRunner {
    config: AgentConfig,
    client: reqwest::Client,
    executor: Arc<dyn TaskExecutor>,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            executor,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.controller_url.trim_end_matches('/'))
    }

    /// Register this host. Idempotent; re-running refreshes hostname and
    /// capabilities.
    pub async fn register(&self) -> Result<AgentRecord, AgentError> {
        let response = self
            .client
            .post(self.url("/api/v1/agents/register"))
            .json(&json!({
                "host_id": self.config.host_id,
                "hostname": self.config.hostname,
                "capabilities": self.config.capabilities,
            }))
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    /// Report liveness and coarse resource usage.
    pub async fn heartbeat(&self) -> Result<(), AgentError> {
        let response = self
            .client
            .post(self.url(&format!(
                "/api/v1/agents/{}/heartbeat",
                self.config.host_id
            )))
            .json(&json!({
                "status": AgentStatus::Healthy,
                "resource_usage": {"pid": std::process::id()},
            }))
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    /// One poll cycle: claim at most one task, execute it, report the
    /// outcome. Returns the task that was handled, if any.
    pub async fn poll_once(&self) -> Result<Option<Task>, AgentError> {
        let response = self
            .client
            .get(self.url(&format!("/api/v1/agents/{}/tasks", self.config.host_id)))
            .send()
            .await?;
        let poll: PollResponse = checked(response).await?.json().await?;
        let Some(task) = poll.task else {
            return Ok(None);
        };

        tracing::info!(task_id = %task.id, action = task.action.as_str(), "task claimed");
        self.signal_start(&task).await?;

        match self.executor.execute(&task).await {
            Ok(result) => {
                tracing::info!(task_id = %task.id, "task completed");
                self.report(&task, json!({"result": result})).await?;
            }
            Err(error) => {
                tracing::warn!(task_id = %task.id, error, "task failed");
                self.report(&task, json!({"error": error})).await?;
            }
        }
        Ok(Some(task))
    }

    async fn signal_start(&self, task: &Task) -> Result<(), AgentError> {
        let response = self
            .client
            .post(self.url(&format!(
                "/api/v1/agents/{}/tasks/{}/start",
                self.config.host_id, task.id
            )))
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn report(&self, task: &Task, body: Value) -> Result<(), AgentError> {
        let response = self
            .client
            .post(self.url(&format!(
                "/api/v1/agents/{}/tasks/{}/result",
                self.config.host_id, task.id
            )))
            .json(&body)
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    /// Push collected metric samples to the aggregator.
    pub async fn push_metrics(&self, push: &MetricPush) -> Result<u64, AgentError> {
        let response = self
            .client
            .post(self.url(&format!(
                "/api/v1/agents/{}/metrics",
                self.config.host_id
            )))
            .json(push)
            .send()
            .await?;
        let body: Value = checked(response).await?.json().await?;
        Ok(body.get("inserted").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Run the agent until the process exits: register (with retry), then
    /// heartbeat and poll on independent intervals.
    pub async fn run(self) -> Result<(), AgentError> {
        loop {
            match self.register().await {
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "registration failed, retrying");
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
        tracing::info!(host_id = %self.config.host_id, "agent registered");

        // First heartbeat before the first poll, so the claim is not refused
        // for staleness.
        if let Err(e) = self.heartbeat().await {
            tracing::warn!(error = %e, "initial heartbeat failed");
        }

        let beat = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(beat.config.heartbeat_interval());
            loop {
                ticker.tick().await;
                if let Err(e) = beat.heartbeat().await {
                    tracing::warn!(error = %e, "heartbeat failed");
                }
            }
        });

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                tracing::warn!(error = %e, "poll failed");
            }
        }
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AgentError::Rejected {
        status: status.as_u16(),
        body,
    })
}
