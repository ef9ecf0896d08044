//! Experiment state machine.
//!
//! Phases advance through a periodic reconciliation tick, never callbacks:
//! `pending → deploying → running → analyzing → {completed | failed}`, with
//! `rolled_back` reachable from the three middle phases via an explicit
//! request. Every transition is a compare-and-swap on the phase column, so
//! concurrent controllers can tick the same experiment and exactly one wins
//! each transition; only the winner appends the event and publishes it.
//! Task emission is guarded by existence checks, so re-running a tick on an
//! unchanged experiment is a no-op.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::broadcast::EventBroadcaster;
use crate::config::ControllerConfig;
use crate::errors::ExperimentError;
use crate::metrics::compute_cost_analysis;
use crate::model::{
    DeploymentStatus, Experiment, ExperimentPhase, NewExperiment, NewTask, PipelineDeployment,
    TaskAction, TaskStatus, Variant, ROLLBACK_PRIORITY,
};
use crate::scheduler::TaskScheduler;
use crate::store::Store;

/// Time source for the reconciliation logic. Production uses the system
/// clock; tests drive a manual one through warmup and collection windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct ExperimentEngine {
    store: Arc<Store>,
    scheduler: Arc<TaskScheduler>,
    broadcaster: EventBroadcaster,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: chrono::Duration,
    max_analysis_attempts: i64,
}

impl ExperimentEngine {
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<TaskScheduler>,
        broadcaster: EventBroadcaster,
        config: &ControllerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            scheduler,
            broadcaster,
            clock,
            heartbeat_timeout: config.heartbeat_timeout(),
            max_analysis_attempts: config.max_analysis_attempts,
        }
    }

    // -----------------------------------------------------------------------
    // API entry points
    // -----------------------------------------------------------------------

    /// Create an experiment in `pending`; the next tick starts deployment.
    pub fn create_experiment(&self, req: &NewExperiment) -> Result<Experiment, ExperimentError> {
        if req.name.trim().is_empty() {
            return Err(ExperimentError::Invalid("name must not be empty".into()));
        }
        if req.target_hosts.is_empty() {
            return Err(ExperimentError::Invalid(
                "target_hosts must name at least one host".into(),
            ));
        }
        if req.duration_secs <= 0 || req.warmup_secs < 0 {
            return Err(ExperimentError::Invalid(
                "duration must be positive and warmup non-negative".into(),
            ));
        }
        for (side, pipeline) in [
            ("baseline_pipeline", &req.baseline_pipeline),
            ("candidate_pipeline", &req.candidate_pipeline),
        ] {
            if !pipeline.is_object() {
                return Err(ExperimentError::Invalid(format!(
                    "{side} must be a JSON object"
                )));
            }
        }

        let now = self.clock.now();
        let exp = self.store.create_experiment(req, now)?;
        self.record_event(
            exp.id,
            "experiment_created",
            ExperimentPhase::Pending,
            &format!("experiment '{}' created for {} host(s)", exp.name, exp.target_hosts.len()),
            json!({"target_hosts": exp.target_hosts}),
            now,
        )?;
        tracing::info!(experiment_id = %exp.id, name = %exp.name, "experiment created");
        Ok(exp)
    }

    /// Request rollback of a live experiment. Emits one high-priority
    /// rollback task per target host; the phase flips to `rolled_back` once
    /// they all complete. Idempotent: repeated requests add no tasks.
    pub fn request_rollback(&self, id: Uuid) -> Result<Experiment, ExperimentError> {
        let exp = self
            .store
            .get_experiment(id)?
            .ok_or(ExperimentError::NotFound(id))?;
        if exp.phase == ExperimentPhase::RolledBack {
            return Ok(exp);
        }
        if !exp.phase.can_rollback() {
            return Err(ExperimentError::InvalidPhase {
                id,
                phase: exp.phase.as_str(),
                operation: "rollback",
            });
        }

        let now = self.clock.now();
        let mut created = 0;
        for host in &exp.target_hosts {
            if self.store.has_task(id, TaskAction::Rollback, None, host)? {
                continue;
            }
            self.scheduler.create_task(
                &NewTask {
                    host_id: host.clone(),
                    experiment_id: Some(id),
                    action: TaskAction::Rollback,
                    variant: None,
                    config: json!({"experiment_id": id}),
                    priority: ROLLBACK_PRIORITY,
                },
                now,
            )?;
            created += 1;
        }
        if created > 0 {
            self.record_event(
                id,
                "rollback_requested",
                exp.phase,
                &format!("rollback requested; {created} rollback task(s) emitted"),
                json!({"tasks_created": created}),
                now,
            )?;
        }
        Ok(self
            .store
            .get_experiment(id)?
            .ok_or(ExperimentError::NotFound(id))?)
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// One full reconciliation tick over agents and experiments.
    pub fn reconcile_all(&self) -> Result<(), ExperimentError> {
        let now = self.clock.now();
        let stale = self.store.mark_stale_agents(self.heartbeat_timeout, now)?;
        if stale > 0 {
            tracing::warn!(count = stale, "agents marked unhealthy (stale heartbeat)");
        }

        for exp in self.store.list_experiments()? {
            if exp.phase.is_terminal() {
                continue;
            }
            if let Err(e) = self.reconcile(exp.id) {
                tracing::error!(experiment_id = %exp.id, error = %e, "reconcile failed");
            }
        }
        Ok(())
    }

    /// Reconcile a single experiment. Idempotent: re-running on an unchanged
    /// experiment emits no duplicate tasks or events.
    pub fn reconcile(&self, id: Uuid) -> Result<(), ExperimentError> {
        let exp = self
            .store
            .get_experiment(id)?
            .ok_or(ExperimentError::NotFound(id))?;
        if exp.phase.is_terminal() {
            return Ok(());
        }

        // A rollback in flight supersedes normal advancement; late results
        // for stale tasks are absorbed by the scheduler and ignored here.
        let rollback_tasks = self
            .store
            .tasks_for_experiment(id, Some(TaskAction::Rollback))?;
        if !rollback_tasks.is_empty() {
            return self.check_rollback(&exp, &rollback_tasks);
        }

        match exp.phase {
            ExperimentPhase::Pending => self.begin_deploy(&exp),
            ExperimentPhase::Deploying => self.check_deploys(&exp),
            ExperimentPhase::Running => self.check_elapsed(&exp),
            ExperimentPhase::Analyzing => self.try_analyze(&exp),
            _ => Ok(()),
        }
    }

    /// `pending → deploying`: one deploy task and one deployment row per
    /// (variant, target host) pair.
    fn begin_deploy(&self, exp: &Experiment) -> Result<(), ExperimentError> {
        let now = self.clock.now();
        for host in &exp.target_hosts {
            for variant in Variant::ALL {
                let pipeline = match variant {
                    Variant::Baseline => &exp.baseline_pipeline,
                    Variant::Candidate => &exp.candidate_pipeline,
                };
                if !self
                    .store
                    .has_task(exp.id, TaskAction::Deploy, Some(variant), host)?
                {
                    self.scheduler.create_task(
                        &NewTask {
                            host_id: host.clone(),
                            experiment_id: Some(exp.id),
                            action: TaskAction::Deploy,
                            variant: Some(variant),
                            config: json!({
                                "experiment_id": exp.id,
                                "variant": variant,
                                "pipeline": pipeline,
                            }),
                            priority: 0,
                        },
                        now,
                    )?;
                }
                self.store.upsert_deployment(&PipelineDeployment {
                    id: Uuid::new_v4(),
                    experiment_id: exp.id,
                    name: pipeline
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(&exp.name)
                        .to_string(),
                    namespace: "telemetry".to_string(),
                    pipeline: pipeline.clone(),
                    variant,
                    host_id: host.clone(),
                    status: DeploymentStatus::Deploying,
                    metrics: json!({}),
                })?;
            }
        }

        self.transition(
            exp,
            ExperimentPhase::Deploying,
            "deploy tasks emitted for all variant/host pairs",
            json!({"hosts": exp.target_hosts.len(), "variants": 2}),
            now,
        )
    }

    /// `deploying → running` once every deploy task completed, or
    /// `deploying → failed` as soon as one exhausts its retries.
    fn check_deploys(&self, exp: &Experiment) -> Result<(), ExperimentError> {
        let now = self.clock.now();
        let tasks = self
            .store
            .tasks_for_experiment(exp.id, Some(TaskAction::Deploy))?;
        let expected = exp.target_hosts.len() * Variant::ALL.len();

        if let Some(failed) = tasks.iter().find(|t| t.status == TaskStatus::Failed) {
            return self.transition(
                exp,
                ExperimentPhase::Failed,
                &format!(
                    "deploy task {} on {} exhausted retries: {}",
                    failed.id,
                    failed.host_id,
                    failed.error_message.as_deref().unwrap_or("unknown error")
                ),
                json!({"task_id": failed.id, "host_id": failed.host_id}),
                now,
            );
        }

        let completed: Vec<_> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        for task in &completed {
            if let Some(variant) = task.variant {
                self.store.set_deployment_status(
                    exp.id,
                    variant,
                    &task.host_id,
                    DeploymentStatus::Active,
                )?;
            }
        }

        if tasks.len() >= expected && completed.len() == tasks.len() {
            self.transition(
                exp,
                ExperimentPhase::Running,
                "all pipelines deployed; collection window open",
                json!({"deploy_tasks": tasks.len()}),
                now,
            )?;
        }
        Ok(())
    }

    /// `running → analyzing` once warmup + duration have elapsed.
    fn check_elapsed(&self, exp: &Experiment) -> Result<(), ExperimentError> {
        let now = self.clock.now();
        match exp.collection_deadline() {
            Some(deadline) if now >= deadline => self.transition(
                exp,
                ExperimentPhase::Analyzing,
                "collection window elapsed; aggregating",
                json!({"deadline": deadline}),
                now,
            ),
            _ => Ok(()),
        }
    }

    /// `analyzing → completed` once aggregation produces a result, or
    /// `analyzing → failed` after the bounded retry budget.
    fn try_analyze(&self, exp: &Experiment) -> Result<(), ExperimentError> {
        let now = self.clock.now();
        match compute_cost_analysis(&self.store, exp, now) {
            Ok(Some(analysis)) => {
                let value = serde_json::to_value(&analysis).map_err(crate::errors::StoreError::from)?;
                self.store.set_cost_analysis(exp.id, &value)?;
                self.transition(
                    exp,
                    ExperimentPhase::Completed,
                    &format!(
                        "analysis complete: {:.1}% cardinality reduction{}",
                        analysis.reduction_percent,
                        if analysis.partial { " (partial data)" } else { "" }
                    ),
                    json!({
                        "reduction_percent": analysis.reduction_percent,
                        "partial": analysis.partial,
                    }),
                    now,
                )
            }
            Ok(None) => self.analysis_retry(exp, "no metric samples yet", now),
            Err(e) => {
                tracing::warn!(experiment_id = %exp.id, error = %e, "aggregation failed");
                self.analysis_retry(exp, &e.to_string(), now)
            }
        }
    }

    fn analysis_retry(
        &self,
        exp: &Experiment,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ExperimentError> {
        let attempts = self.store.increment_analysis_attempts(exp.id)?;
        if attempts >= self.max_analysis_attempts {
            self.transition(
                exp,
                ExperimentPhase::Failed,
                &format!("aggregation gave no result after {attempts} attempts: {reason}"),
                json!({"attempts": attempts}),
                now,
            )
        } else {
            tracing::debug!(
                experiment_id = %exp.id,
                attempts,
                reason,
                "aggregation retry scheduled"
            );
            Ok(())
        }
    }

    /// Freeze at `rolled_back` once every rollback task completed.
    fn check_rollback(
        &self,
        exp: &Experiment,
        rollback_tasks: &[crate::model::Task],
    ) -> Result<(), ExperimentError> {
        let now = self.clock.now();
        if rollback_tasks
            .iter()
            .any(|t| t.status == TaskStatus::Failed)
        {
            // A host that cannot roll back needs operator attention; the
            // experiment stays queryable in its current phase.
            tracing::error!(experiment_id = %exp.id, "rollback task failed permanently");
            return Ok(());
        }
        if rollback_tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed)
        {
            self.store.stop_deployments(exp.id)?;
            self.transition(
                exp,
                ExperimentPhase::RolledBack,
                "all rollback tasks completed; experiment frozen",
                json!({"rollback_tasks": rollback_tasks.len()}),
                now,
            )?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transition plumbing
    // -----------------------------------------------------------------------

    /// CAS the phase forward; on success append exactly one event and
    /// publish it. Losing the CAS (another controller got there first) is
    /// silent by design.
    fn transition(
        &self,
        exp: &Experiment,
        to: ExperimentPhase,
        message: &str,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Result<(), ExperimentError> {
        if !self.store.transition_phase(exp.id, exp.phase, to, now)? {
            return Ok(());
        }
        tracing::info!(
            experiment_id = %exp.id,
            from = exp.phase.as_str(),
            to = to.as_str(),
            "phase transition"
        );
        self.record_event(exp.id, "phase_changed", to, message, metadata, now)?;
        Ok(())
    }

    fn record_event(
        &self,
        experiment_id: Uuid,
        event_type: &str,
        phase: ExperimentPhase,
        message: &str,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Result<(), ExperimentError> {
        let event = self
            .store
            .append_event(experiment_id, event_type, phase, message, metadata, now)?;
        self.broadcaster.publish(&event);
        Ok(())
    }

    /// Background reconciliation loop; runs until the process exits.
    pub async fn run_reconciler(self: Arc<Self>, period: std::time::Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile_all() {
                tracing::error!(error = %e, "reconciliation tick failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStatus, PushedSample, TaskReport};
    use parking_lot::Mutex;

    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Utc::now()),
            })
        }

        fn advance(&self, d: chrono::Duration) {
            let mut now = self.now.lock();
            *now += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }

    struct Harness {
        store: Arc<Store>,
        scheduler: Arc<TaskScheduler>,
        engine: ExperimentEngine,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = ControllerConfig {
            max_retries: 1,
            max_analysis_attempts: 3,
            heartbeat_timeout_secs: 3600,
            ..Default::default()
        };
        let scheduler = Arc::new(TaskScheduler::new(store.clone(), &config));
        let clock = ManualClock::new();
        let engine = ExperimentEngine::new(
            store.clone(),
            scheduler.clone(),
            EventBroadcaster::new(64),
            &config,
            clock.clone(),
        );
        Harness {
            store,
            scheduler,
            engine,
            clock,
        }
    }

    fn request(hosts: &[&str]) -> NewExperiment {
        NewExperiment {
            name: "trim-labels".into(),
            baseline_pipeline: json!({"name": "full"}),
            candidate_pipeline: json!({"name": "trimmed"}),
            target_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            duration_secs: 600,
            warmup_secs: 60,
        }
    }

    fn heartbeat(h: &Harness, host: &str) {
        h.store
            .record_heartbeat(host, AgentStatus::Healthy, &json!({}), h.clock.now())
            .unwrap();
    }

    /// Claim and complete every claimable task for a host.
    fn drain_host(h: &Harness, host: &str) {
        heartbeat(h, host);
        while let Some(task) = h.scheduler.claim_next(host, h.clock.now()).unwrap() {
            h.scheduler
                .report_result(
                    task.id,
                    &TaskReport {
                        result: Some(json!({"ok": true})),
                        error: None,
                    },
                    h.clock.now(),
                )
                .unwrap();
        }
    }

    #[test]
    fn creation_validates_input() {
        let h = harness();
        let mut bad = request(&["h1"]);
        bad.target_hosts.clear();
        assert!(matches!(
            h.engine.create_experiment(&bad),
            Err(ExperimentError::Invalid(_))
        ));

        let mut bad = request(&["h1"]);
        bad.baseline_pipeline = json!("not-an-object");
        assert!(h.engine.create_experiment(&bad).is_err());

        let mut bad = request(&["h1"]);
        bad.duration_secs = 0;
        assert!(h.engine.create_experiment(&bad).is_err());
    }

    #[test]
    fn end_to_end_two_hosts() {
        let h = harness();
        let exp = h.engine.create_experiment(&request(&["h1", "h2"])).unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Pending);

        // Tick 1: deploy tasks emitted, phase deploying.
        h.engine.reconcile(exp.id).unwrap();
        let exp1 = h.store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(exp1.phase, ExperimentPhase::Deploying);
        let deploys = h
            .store
            .tasks_for_experiment(exp.id, Some(TaskAction::Deploy))
            .unwrap();
        assert_eq!(deploys.len(), 4, "2 hosts x 2 variants");
        assert_eq!(h.store.list_deployments(exp.id).unwrap().len(), 4);

        // Re-ticking an unchanged experiment emits nothing new.
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store
                .tasks_for_experiment(exp.id, Some(TaskAction::Deploy))
                .unwrap()
                .len(),
            4
        );

        // One host done is not enough.
        drain_host(&h, "h1");
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::Deploying
        );

        // Both hosts done: running, deployments active.
        drain_host(&h, "h2");
        h.engine.reconcile(exp.id).unwrap();
        let exp2 = h.store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(exp2.phase, ExperimentPhase::Running);
        assert!(exp2.started_at.is_some());
        assert!(h
            .store
            .list_deployments(exp.id)
            .unwrap()
            .iter()
            .all(|d| d.status == DeploymentStatus::Active));

        // Window not elapsed yet.
        h.clock.advance(chrono::Duration::seconds(300));
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::Running
        );

        // Past warmup + duration: analyzing.
        h.clock.advance(chrono::Duration::seconds(400));
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::Analyzing
        );

        // Samples arrive; next tick completes with a cached analysis.
        let series = |n: usize| -> Vec<PushedSample> {
            (0..n)
                .map(|i| PushedSample {
                    metric_name: "spans".into(),
                    value: 1.0,
                    labels: json!({"route": format!("/{i}")}),
                    recorded_at: None,
                })
                .collect()
        };
        h.store
            .insert_samples(exp.id, Variant::Baseline, "h1", &series(10), h.clock.now())
            .unwrap();
        h.store
            .insert_samples(exp.id, Variant::Candidate, "h2", &series(3), h.clock.now())
            .unwrap();
        h.engine.reconcile(exp.id).unwrap();

        let done = h.store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(done.phase, ExperimentPhase::Completed);
        assert!(done.completed_at.is_some());
        let analysis = done.cost_analysis.unwrap();
        assert!((analysis["reduction_percent"].as_f64().unwrap() - 70.0).abs() < 1e-9);

        // Exactly one event per transition, in order.
        let events = h.store.events_after(exp.id, 0).unwrap();
        let phases: Vec<_> = events.iter().map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![
                ExperimentPhase::Pending,   // experiment_created
                ExperimentPhase::Deploying,
                ExperimentPhase::Running,
                ExperimentPhase::Analyzing,
                ExperimentPhase::Completed,
            ]
        );
        let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn deploy_retry_exhaustion_fails_experiment() {
        let h = harness();
        let exp = h.engine.create_experiment(&request(&["h1"])).unwrap();
        h.engine.reconcile(exp.id).unwrap();

        heartbeat(&h, "h1");
        let fail = TaskReport {
            result: None,
            error: Some("collector refused config".into()),
        };
        // max_retries = 1: first failure requeues, second is permanent.
        for _ in 0..2 {
            let task = h.scheduler.claim_next("h1", h.clock.now()).unwrap().unwrap();
            h.scheduler.report_result(task.id, &fail, h.clock.now()).unwrap();
        }

        h.engine.reconcile(exp.id).unwrap();
        let exp = h.store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Failed);
    }

    #[test]
    fn analysis_budget_exhaustion_fails_experiment() {
        let h = harness();
        let exp = h.engine.create_experiment(&request(&["h1"])).unwrap();
        h.engine.reconcile(exp.id).unwrap();
        drain_host(&h, "h1");
        h.engine.reconcile(exp.id).unwrap();
        h.clock.advance(chrono::Duration::seconds(700));
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::Analyzing
        );

        // No samples ever arrive; max_analysis_attempts = 3 ticks.
        for _ in 0..3 {
            h.engine.reconcile(exp.id).unwrap();
        }
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::Failed
        );
    }

    #[test]
    fn rollback_from_running_waits_for_all_hosts() {
        let h = harness();
        let exp = h.engine.create_experiment(&request(&["h1", "h2"])).unwrap();
        h.engine.reconcile(exp.id).unwrap();
        drain_host(&h, "h1");
        drain_host(&h, "h2");
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::Running
        );

        h.engine.request_rollback(exp.id).unwrap();
        // Idempotent: a second request adds no tasks.
        h.engine.request_rollback(exp.id).unwrap();
        let rollbacks = h
            .store
            .tasks_for_experiment(exp.id, Some(TaskAction::Rollback))
            .unwrap();
        assert_eq!(rollbacks.len(), 2, "one per original target host");
        assert!(rollbacks.iter().all(|t| t.priority == ROLLBACK_PRIORITY));

        // Not rolled back until every host finished.
        drain_host(&h, "h1");
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::Running
        );

        drain_host(&h, "h2");
        h.engine.reconcile(exp.id).unwrap();
        let exp = h.store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::RolledBack);
        assert!(h
            .store
            .list_deployments(exp.id)
            .unwrap()
            .iter()
            .all(|d| d.status == DeploymentStatus::Stopped));

        // Frozen: further ticks change nothing.
        h.clock.advance(chrono::Duration::seconds(10_000));
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::RolledBack
        );
    }

    #[test]
    fn rollback_rejected_for_pending_and_terminal() {
        let h = harness();
        let exp = h.engine.create_experiment(&request(&["h1"])).unwrap();
        assert!(matches!(
            h.engine.request_rollback(exp.id),
            Err(ExperimentError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn rollback_interrupts_analyzing() {
        let h = harness();
        let exp = h.engine.create_experiment(&request(&["h1"])).unwrap();
        h.engine.reconcile(exp.id).unwrap();
        drain_host(&h, "h1");
        h.engine.reconcile(exp.id).unwrap();
        h.clock.advance(chrono::Duration::seconds(700));
        h.engine.reconcile(exp.id).unwrap();

        h.engine.request_rollback(exp.id).unwrap();
        drain_host(&h, "h1");
        h.engine.reconcile(exp.id).unwrap();
        assert_eq!(
            h.store.get_experiment(exp.id).unwrap().unwrap().phase,
            ExperimentPhase::RolledBack
        );
    }
}
