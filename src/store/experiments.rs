//! Experiment rows, the append-only event log, and pipeline deployments.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use super::{fmt_ts, parse_enum, parse_json, parse_ts, parse_ts_opt, parse_uuid, Store};
use crate::errors::StoreError;
use crate::model::{
    DeploymentStatus, Experiment, ExperimentEvent, ExperimentPhase, NewExperiment,
    PipelineDeployment, Variant,
};

const EXPERIMENT_COLUMNS: &str = "id, name, phase, baseline_pipeline, candidate_pipeline, \
     target_hosts, duration_secs, warmup_secs, created_at, started_at, completed_at, \
     analysis_attempts, cost_analysis";

fn experiment_from_row(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let hosts_raw: String = row.get(5)?;
    Ok(Experiment {
        id: parse_uuid(0, row.get(0)?)?,
        name: row.get(1)?,
        phase: parse_enum(2, &row.get::<_, String>(2)?, ExperimentPhase::parse)?,
        baseline_pipeline: parse_json(3, row.get(3)?)?,
        candidate_pipeline: parse_json(4, row.get(4)?)?,
        target_hosts: parse_json(5, hosts_raw).map(|v| {
            v.as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|h| h.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        })?,
        duration_secs: row.get(6)?,
        warmup_secs: row.get(7)?,
        created_at: parse_ts(8, row.get(8)?)?,
        started_at: parse_ts_opt(9, row.get(9)?)?,
        completed_at: parse_ts_opt(10, row.get(10)?)?,
        analysis_attempts: row.get(11)?,
        cost_analysis: row
            .get::<_, Option<String>>(12)?
            .map(|s| parse_json(12, s))
            .transpose()?,
    })
}

impl Store {
    /// Insert a new experiment in `pending` phase.
    pub fn create_experiment(
        &self,
        req: &NewExperiment,
        now: DateTime<Utc>,
    ) -> Result<Experiment, StoreError> {
        let id = Uuid::new_v4();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO experiments
                 (id, name, phase, baseline_pipeline, candidate_pipeline, target_hosts,
                  duration_secs, warmup_secs, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                req.name,
                serde_json::to_string(&req.baseline_pipeline)?,
                serde_json::to_string(&req.candidate_pipeline)?,
                serde_json::to_string(&req.target_hosts)?,
                req.duration_secs,
                req.warmup_secs,
                fmt_ts(now),
            ],
        )?;
        drop(conn);
        self.get_experiment(id)?
            .ok_or_else(|| StoreError::not_found("experiment", id))
    }

    pub fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError> {
        let conn = self.conn();
        let exp = conn
            .query_row(
                &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = ?1"),
                params![id.to_string()],
                experiment_from_row,
            )
            .optional()?;
        Ok(exp)
    }

    pub fn list_experiments(&self) -> Result<Vec<Experiment>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiments ORDER BY created_at DESC, id"
        ))?;
        let rows = stmt.query_map([], experiment_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Atomic phase transition: applies only if the row is still in `from`.
    ///
    /// Sets `started_at` when entering `running` and `completed_at` when
    /// entering a terminal phase. Returns whether this caller won the
    /// transition; the loser of a concurrent-controller race gets `false`
    /// and must not emit side effects.
    pub fn transition_phase(
        &self,
        id: Uuid,
        from: ExperimentPhase,
        to: ExperimentPhase,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = if to == ExperimentPhase::Running {
            conn.execute(
                "UPDATE experiments SET phase = ?1, started_at = ?2
                 WHERE id = ?3 AND phase = ?4",
                params![to.as_str(), fmt_ts(now), id.to_string(), from.as_str()],
            )?
        } else if to.is_terminal() {
            conn.execute(
                "UPDATE experiments SET phase = ?1, completed_at = ?2
                 WHERE id = ?3 AND phase = ?4",
                params![to.as_str(), fmt_ts(now), id.to_string(), from.as_str()],
            )?
        } else {
            conn.execute(
                "UPDATE experiments SET phase = ?1 WHERE id = ?2 AND phase = ?3",
                params![to.as_str(), id.to_string(), from.as_str()],
            )?
        };
        Ok(changed == 1)
    }

    /// Bump the bounded aggregation-retry counter, returning the new value.
    pub fn increment_analysis_attempts(&self, id: Uuid) -> Result<i64, StoreError> {
        let conn = self.conn();
        let attempts = conn.query_row(
            "UPDATE experiments SET analysis_attempts = analysis_attempts + 1
             WHERE id = ?1
             RETURNING analysis_attempts",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Cache the aggregator's result on the experiment row.
    pub fn set_cost_analysis(&self, id: Uuid, analysis: &Value) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE experiments SET cost_analysis = ?1 WHERE id = ?2",
            params![serde_json::to_string(analysis)?, id.to_string()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Append an event, assigning the next per-experiment sequence number
    /// inside the same transaction.
    pub fn append_event(
        &self,
        experiment_id: Uuid,
        event_type: &str,
        phase: ExperimentPhase,
        message: &str,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Result<ExperimentEvent, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM experiment_events WHERE experiment_id = ?1",
            params![experiment_id.to_string()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO experiment_events
                 (experiment_id, seq, event_type, phase, message, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                experiment_id.to_string(),
                seq,
                event_type,
                phase.as_str(),
                message,
                serde_json::to_string(&metadata)?,
                fmt_ts(now),
            ],
        )?;
        tx.commit()?;
        Ok(ExperimentEvent {
            experiment_id,
            seq,
            event_type: event_type.to_string(),
            phase,
            message: message.to_string(),
            metadata,
            created_at: now,
        })
    }

    /// Events with seq strictly greater than `after`, in order. The replay
    /// source for reconnecting WebSocket subscribers.
    pub fn events_after(
        &self,
        experiment_id: Uuid,
        after: i64,
    ) -> Result<Vec<ExperimentEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT experiment_id, seq, event_type, phase, message, metadata, created_at
             FROM experiment_events
             WHERE experiment_id = ?1 AND seq > ?2
             ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![experiment_id.to_string(), after], |row| {
            Ok(ExperimentEvent {
                experiment_id: parse_uuid(0, row.get(0)?)?,
                seq: row.get(1)?,
                event_type: row.get(2)?,
                phase: parse_enum(3, &row.get::<_, String>(3)?, ExperimentPhase::parse)?,
                message: row.get(4)?,
                metadata: parse_json(5, row.get(5)?)?,
                created_at: parse_ts(6, row.get(6)?)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Deployments
    // -----------------------------------------------------------------------

    /// Record (or refresh) the deployment row for one (experiment, variant,
    /// host) triple. The unique constraint keeps re-runs idempotent.
    pub fn upsert_deployment(&self, dep: &PipelineDeployment) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pipeline_deployments
                 (id, experiment_id, name, namespace, pipeline, variant, host_id, status, metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (experiment_id, variant, host_id) DO UPDATE SET
                 name = excluded.name,
                 namespace = excluded.namespace,
                 pipeline = excluded.pipeline",
            params![
                dep.id.to_string(),
                dep.experiment_id.to_string(),
                dep.name,
                dep.namespace,
                serde_json::to_string(&dep.pipeline)?,
                dep.variant.as_str(),
                dep.host_id,
                dep.status.as_str(),
                serde_json::to_string(&dep.metrics)?,
            ],
        )?;
        Ok(())
    }

    pub fn set_deployment_status(
        &self,
        experiment_id: Uuid,
        variant: Variant,
        host_id: &str,
        status: DeploymentStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE pipeline_deployments SET status = ?1
             WHERE experiment_id = ?2 AND variant = ?3 AND host_id = ?4",
            params![
                status.as_str(),
                experiment_id.to_string(),
                variant.as_str(),
                host_id
            ],
        )?;
        Ok(changed == 1)
    }

    /// Mark every deployment of an experiment stopped (rollback completed).
    pub fn stop_deployments(&self, experiment_id: Uuid) -> Result<usize, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE pipeline_deployments SET status = 'stopped'
             WHERE experiment_id = ?1 AND status != 'stopped'",
            params![experiment_id.to_string()],
        )?;
        Ok(changed)
    }

    pub fn list_deployments(
        &self,
        experiment_id: Uuid,
    ) -> Result<Vec<PipelineDeployment>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, experiment_id, name, namespace, pipeline, variant, host_id, status, metrics
             FROM pipeline_deployments
             WHERE experiment_id = ?1
             ORDER BY variant, host_id",
        )?;
        let rows = stmt.query_map(params![experiment_id.to_string()], |row| {
            Ok(PipelineDeployment {
                id: parse_uuid(0, row.get(0)?)?,
                experiment_id: parse_uuid(1, row.get(1)?)?,
                name: row.get(2)?,
                namespace: row.get(3)?,
                pipeline: parse_json(4, row.get(4)?)?,
                variant: parse_enum(5, &row.get::<_, String>(5)?, Variant::parse)?,
                host_id: row.get(6)?,
                status: parse_enum(7, &row.get::<_, String>(7)?, DeploymentStatus::parse)?,
                metrics: parse_json(8, row.get(8)?)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Distinct pipeline configurations referenced by experiments, for the
    /// pipeline listing endpoint.
    pub fn list_pipelines(&self) -> Result<Vec<Value>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT baseline_pipeline FROM experiments
             UNION
             SELECT DISTINCT candidate_pipeline FROM experiments",
        )?;
        let rows = stmt.query_map([], |row| parse_json(0, row.get(0)?))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> NewExperiment {
        NewExperiment {
            name: "drop-span-labels".into(),
            baseline_pipeline: json!({"name": "current", "processors": []}),
            candidate_pipeline: json!({"name": "trimmed", "processors": ["drop_labels"]}),
            target_hosts: vec!["h1".into(), "h2".into()],
            duration_secs: 600,
            warmup_secs: 60,
        }
    }

    #[test]
    fn create_and_fetch_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let exp = store.create_experiment(&sample_request(), Utc::now()).unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Pending);
        assert_eq!(exp.target_hosts, vec!["h1", "h2"]);
        assert!(exp.started_at.is_none());

        let fetched = store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(fetched.name, "drop-span-labels");
        assert_eq!(fetched.baseline_pipeline["name"], "current");
    }

    #[test]
    fn phase_cas_rejects_stale_from() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let exp = store.create_experiment(&sample_request(), now).unwrap();

        assert!(store
            .transition_phase(exp.id, ExperimentPhase::Pending, ExperimentPhase::Deploying, now)
            .unwrap());
        // Second caller with the stale `from` loses.
        assert!(!store
            .transition_phase(exp.id, ExperimentPhase::Pending, ExperimentPhase::Deploying, now)
            .unwrap());

        assert!(store
            .transition_phase(exp.id, ExperimentPhase::Deploying, ExperimentPhase::Running, now)
            .unwrap());
        let exp = store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Running);
        assert!(exp.started_at.is_some());
    }

    #[test]
    fn terminal_transition_sets_completed_at() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let exp = store.create_experiment(&sample_request(), now).unwrap();
        store
            .transition_phase(exp.id, ExperimentPhase::Pending, ExperimentPhase::Failed, now)
            .unwrap();
        let exp = store.get_experiment(exp.id).unwrap().unwrap();
        assert!(exp.completed_at.is_some());
    }

    #[test]
    fn event_seq_is_monotonic_per_experiment() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let a = store.create_experiment(&sample_request(), now).unwrap();
        let b = store.create_experiment(&sample_request(), now).unwrap();

        for i in 0..3 {
            let evt = store
                .append_event(a.id, "tick", ExperimentPhase::Pending, &format!("e{i}"), json!({}), now)
                .unwrap();
            assert_eq!(evt.seq, i + 1);
        }
        let evt = store
            .append_event(b.id, "tick", ExperimentPhase::Pending, "other", json!({}), now)
            .unwrap();
        assert_eq!(evt.seq, 1, "sequences are per experiment");

        let replay = store.events_after(a.id, 1).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].seq, 2);
        assert_eq!(replay[1].seq, 3);
    }

    #[test]
    fn deployment_upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let exp = store.create_experiment(&sample_request(), now).unwrap();
        let dep = PipelineDeployment {
            id: Uuid::new_v4(),
            experiment_id: exp.id,
            name: "trimmed".into(),
            namespace: "telemetry".into(),
            pipeline: json!({"name": "trimmed"}),
            variant: Variant::Candidate,
            host_id: "h1".into(),
            status: DeploymentStatus::Deploying,
            metrics: json!({}),
        };
        store.upsert_deployment(&dep).unwrap();
        store.upsert_deployment(&dep).unwrap();
        assert_eq!(store.list_deployments(exp.id).unwrap().len(), 1);

        store
            .set_deployment_status(exp.id, Variant::Candidate, "h1", DeploymentStatus::Active)
            .unwrap();
        let deps = store.list_deployments(exp.id).unwrap();
        assert_eq!(deps[0].status, DeploymentStatus::Active);
    }
}
