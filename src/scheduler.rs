//! Task scheduler: creation, exclusive claim, result reporting, lease sweep.
//!
//! The scheduler owns the task lifecycle contract. Exclusivity comes from
//! the store's conditional updates; this layer adds eligibility checks,
//! retry accounting, and the background lease sweeper.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::errors::SchedulerError;
use crate::model::{NewTask, Task, TaskReport, TaskStatus};
use crate::store::{LeaseSweep, Store};

pub struct TaskScheduler {
    store: Arc<Store>,
    lease_timeout: chrono::Duration,
    heartbeat_timeout: chrono::Duration,
    max_retries: i64,
}

impl TaskScheduler {
    pub fn new(store: Arc<Store>, config: &ControllerConfig) -> Self {
        Self {
            store,
            lease_timeout: config.lease_timeout(),
            heartbeat_timeout: config.heartbeat_timeout(),
            max_retries: config.max_retries,
        }
    }

    pub fn create_task(&self, new: &NewTask, now: DateTime<Utc>) -> Result<Task, SchedulerError> {
        let task = self.store.create_task(new, now)?;
        tracing::debug!(
            task_id = %task.id,
            host_id = %task.host_id,
            action = task.action.as_str(),
            priority = task.priority,
            "task created"
        );
        Ok(task)
    }

    /// Claim the next pending task for a host's poll.
    ///
    /// Returns `None` when the host is unregistered, unhealthy, or past the
    /// heartbeat window — a stale agent must never be handed new work.
    pub fn claim_next(
        &self,
        host_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, SchedulerError> {
        let Some(agent) = self.store.get_agent(host_id)? else {
            tracing::debug!(host_id, "claim refused: agent not registered");
            return Ok(None);
        };
        if !agent.is_eligible(now, self.heartbeat_timeout) {
            tracing::debug!(host_id, "claim refused: agent ineligible");
            return Ok(None);
        }
        let claimed = self.store.claim_next_task(host_id, now)?;
        if let Some(task) = &claimed {
            tracing::info!(task_id = %task.id, host_id, "task assigned");
        }
        Ok(claimed)
    }

    /// Record that the agent began executing a claimed task.
    pub fn mark_running(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<Task, SchedulerError> {
        self.store.mark_task_running(task_id, now)?;
        self.store
            .get_task(task_id)?
            .ok_or(SchedulerError::UnknownTask(task_id))
    }

    /// Apply an agent's result report.
    ///
    /// Terminal tasks absorb duplicate reports as no-ops (idempotency key is
    /// the task id). A failure report requeues immediately while retry
    /// budget remains, and fails the task permanently once it is spent.
    pub fn report_result(
        &self,
        task_id: Uuid,
        report: &TaskReport,
        now: DateTime<Utc>,
    ) -> Result<Task, SchedulerError> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or(SchedulerError::UnknownTask(task_id))?;

        if task.status.is_terminal() {
            tracing::debug!(task_id = %task_id, "duplicate report for terminal task ignored");
            return Ok(task);
        }

        match &report.error {
            None => {
                self.store
                    .complete_task(task_id, report.result.as_ref(), now)?;
            }
            Some(error) => {
                if task.retry_count >= self.max_retries {
                    tracing::warn!(task_id = %task_id, error, "task failed permanently");
                    self.store.fail_task(task_id, Some(error), now)?;
                } else {
                    tracing::info!(
                        task_id = %task_id,
                        retry = task.retry_count + 1,
                        error,
                        "task failed, requeueing"
                    );
                    self.store.requeue_task(task_id, Some(error))?;
                }
            }
        }

        self.store
            .get_task(task_id)?
            .ok_or(SchedulerError::UnknownTask(task_id))
    }

    /// Requeue (or permanently fail) tasks whose lease has expired.
    pub fn requeue_expired(&self, now: DateTime<Utc>) -> Result<LeaseSweep, SchedulerError> {
        let sweep = self
            .store
            .sweep_expired_leases(self.lease_timeout, self.max_retries, now)?;
        for task in &sweep.requeued {
            tracing::warn!(task_id = %task.id, host_id = %task.host_id, "lease expired, requeued");
        }
        for task in &sweep.failed {
            tracing::error!(task_id = %task.id, host_id = %task.host_id, "lease expired, retries exhausted");
        }
        Ok(sweep)
    }

    /// Background lease sweeper; runs until the process exits.
    pub async fn run_lease_sweeper(self: Arc<Self>, period: std::time::Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.requeue_expired(Utc::now()) {
                tracing::error!(error = %e, "lease sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStatus, TaskAction, Variant};
    use serde_json::json;

    fn fixture() -> (Arc<Store>, TaskScheduler) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = ControllerConfig {
            max_retries: 2,
            heartbeat_timeout_secs: 60,
            lease_timeout_secs: 30,
            ..Default::default()
        };
        let scheduler = TaskScheduler::new(store.clone(), &config);
        (store, scheduler)
    }

    fn deploy_task(host: &str) -> NewTask {
        NewTask {
            host_id: host.into(),
            experiment_id: None,
            action: TaskAction::Deploy,
            variant: Some(Variant::Candidate),
            config: json!({}),
            priority: 0,
        }
    }

    fn heartbeat(store: &Store, host: &str, at: DateTime<Utc>) {
        store
            .record_heartbeat(host, AgentStatus::Healthy, &json!({}), at)
            .unwrap();
    }

    #[test]
    fn unregistered_or_stale_agents_get_nothing() {
        let (store, scheduler) = fixture();
        let now = Utc::now();
        scheduler.create_task(&deploy_task("h1"), now).unwrap();

        // Not registered at all.
        assert!(scheduler.claim_next("h1", now).unwrap().is_none());

        // Heartbeat too old.
        heartbeat(&store, "h1", now - chrono::Duration::seconds(120));
        assert!(scheduler.claim_next("h1", now).unwrap().is_none());

        // Fresh heartbeat: task flows.
        heartbeat(&store, "h1", now);
        assert!(scheduler.claim_next("h1", now).unwrap().is_some());
    }

    #[test]
    fn failure_report_requeues_until_budget_spent() {
        let (store, scheduler) = fixture();
        let now = Utc::now();
        heartbeat(&store, "h1", now);
        let task = scheduler.create_task(&deploy_task("h1"), now).unwrap();
        let fail = TaskReport {
            result: None,
            error: Some("deploy exploded".into()),
        };

        // max_retries = 2: two failure reports requeue, the third is final.
        for attempt in 1..=2 {
            scheduler.claim_next("h1", now).unwrap().unwrap();
            let t = scheduler.report_result(task.id, &fail, now).unwrap();
            assert_eq!(t.status, TaskStatus::Pending);
            assert_eq!(t.retry_count, attempt);
        }
        scheduler.claim_next("h1", now).unwrap().unwrap();
        let t = scheduler.report_result(task.id, &fail, now).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error_message.as_deref(), Some("deploy exploded"));
    }

    #[test]
    fn duplicate_terminal_reports_are_no_ops() {
        let (store, scheduler) = fixture();
        let now = Utc::now();
        heartbeat(&store, "h1", now);
        let task = scheduler.create_task(&deploy_task("h1"), now).unwrap();
        scheduler.claim_next("h1", now).unwrap().unwrap();

        let ok = TaskReport {
            result: Some(json!({"deployed": true})),
            error: None,
        };
        let first = scheduler.report_result(task.id, &ok, now).unwrap();
        assert_eq!(first.status, TaskStatus::Completed);
        let completed_at = first.completed_at;

        // Same payload again, later: nothing moves.
        let later = now + chrono::Duration::seconds(30);
        let second = scheduler.report_result(task.id, &ok, later).unwrap();
        assert_eq!(second.status, TaskStatus::Completed);
        assert_eq!(second.completed_at, completed_at);
        assert_eq!(second.retry_count, first.retry_count);

        // Even a contradictory late report is absorbed.
        let contradiction = TaskReport {
            result: None,
            error: Some("late failure".into()),
        };
        let third = scheduler.report_result(task.id, &contradiction, later).unwrap();
        assert_eq!(third.status, TaskStatus::Completed);
    }

    #[test]
    fn unknown_task_report_is_an_error() {
        let (_, scheduler) = fixture();
        let err = scheduler
            .report_result(Uuid::new_v4(), &TaskReport { result: None, error: None }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTask(_)));
    }
}
