//! Task rows and the atomic claim/requeue/report primitives.
//!
//! Exclusivity lives here: every status move is a single conditional UPDATE
//! guarded by the current status, so at most one caller can ever win a given
//! transition no matter how many controllers or agents race.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use super::{fmt_ts, parse_enum, parse_json, parse_ts, parse_ts_opt, parse_uuid, Store};
use crate::errors::StoreError;
use crate::model::{NewTask, Task, TaskAction, TaskStatus, Variant};

const TASK_COLUMNS: &str = "id, host_id, experiment_id, action, variant, config, priority, \
     status, created_at, assigned_at, started_at, completed_at, result, error_message, \
     retry_count";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: parse_uuid(0, row.get(0)?)?,
        host_id: row.get(1)?,
        experiment_id: row
            .get::<_, Option<String>>(2)?
            .map(|s| parse_uuid(2, s))
            .transpose()?,
        action: parse_enum(3, &row.get::<_, String>(3)?, TaskAction::parse)?,
        variant: row
            .get::<_, Option<String>>(4)?
            .map(|s| parse_enum(4, &s, Variant::parse))
            .transpose()?,
        config: parse_json(5, row.get(5)?)?,
        priority: row.get(6)?,
        status: parse_enum(7, &row.get::<_, String>(7)?, TaskStatus::parse)?,
        created_at: parse_ts(8, row.get(8)?)?,
        assigned_at: parse_ts_opt(9, row.get(9)?)?,
        started_at: parse_ts_opt(10, row.get(10)?)?,
        completed_at: parse_ts_opt(11, row.get(11)?)?,
        result: row
            .get::<_, Option<String>>(12)?
            .map(|s| parse_json(12, s))
            .transpose()?,
        error_message: row.get(13)?,
        retry_count: row.get(14)?,
    })
}

/// Outcome of one lease-expiry sweep.
#[derive(Debug, Default)]
pub struct LeaseSweep {
    /// Tasks returned to `pending` with retry_count + 1.
    pub requeued: Vec<Task>,
    /// Tasks that exhausted their retry budget and went `failed`.
    pub failed: Vec<Task>,
}

impl Store {
    pub fn create_task(&self, new: &NewTask, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let id = Uuid::new_v4();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks
                 (id, host_id, experiment_id, action, variant, config, priority, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                id.to_string(),
                new.host_id,
                new.experiment_id.map(|e| e.to_string()),
                new.action.as_str(),
                new.variant.map(|v| v.as_str()),
                serde_json::to_string(&new.config)?,
                new.priority,
                fmt_ts(now),
            ],
        )?;
        drop(conn);
        self.get_task(id)?
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let conn = self.conn();
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Claim the highest-priority pending task for a host.
    ///
    /// A single compare-and-swap UPDATE: the subselect picks the candidate
    /// (priority desc, then FIFO), the `status = 'pending'` guard makes the
    /// claim exclusive, and RETURNING hands back the claimed row. At most
    /// one concurrent caller can ever observe `changes() == 1` for a given
    /// task.
    pub fn claim_next_task(
        &self,
        host_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let conn = self.conn();
        let task = conn
            .query_row(
                &format!(
                    "UPDATE tasks SET status = 'assigned', assigned_at = ?1
                     WHERE id = (SELECT id FROM tasks
                                 WHERE status = 'pending' AND host_id = ?2
                                 ORDER BY priority DESC, created_at ASC, id ASC
                                 LIMIT 1)
                       AND status = 'pending'
                     RETURNING {TASK_COLUMNS}"
                ),
                params![fmt_ts(now), host_id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Record execution start. Valid only from `assigned`.
    pub fn mark_task_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'assigned'",
            params![fmt_ts(now), id.to_string()],
        )?;
        Ok(changed == 1)
    }

    /// Terminal success. Valid only from `assigned`/`running`; a duplicate
    /// report after the task is terminal changes nothing.
    pub fn complete_task(
        &self,
        id: Uuid,
        result: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'completed', completed_at = ?1, result = ?2,
                              error_message = NULL
             WHERE id = ?3 AND status IN ('assigned', 'running')",
            params![
                fmt_ts(now),
                result.map(serde_json::to_string).transpose()?,
                id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Return a held task to the queue with retry_count + 1.
    pub fn requeue_task(&self, id: Uuid, error: Option<&str>) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'pending', assigned_at = NULL, started_at = NULL,
                              retry_count = retry_count + 1, error_message = ?1
             WHERE id = ?2 AND status IN ('assigned', 'running')",
            params![error, id.to_string()],
        )?;
        Ok(changed == 1)
    }

    /// Terminal failure, once the retry budget is spent.
    pub fn fail_task(
        &self,
        id: Uuid,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'failed', completed_at = ?1, error_message = ?2
             WHERE id = ?3 AND status IN ('assigned', 'running')",
            params![fmt_ts(now), error, id.to_string()],
        )?;
        Ok(changed == 1)
    }

    /// Requeue or permanently fail every task whose lease has expired.
    pub fn sweep_expired_leases(
        &self,
        lease_timeout: chrono::Duration,
        max_retries: i64,
        now: DateTime<Utc>,
    ) -> Result<LeaseSweep, StoreError> {
        let cutoff = fmt_ts(now - lease_timeout);
        let expired: Vec<(Uuid, i64)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, retry_count FROM tasks
                 WHERE status IN ('assigned', 'running') AND assigned_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok((parse_uuid(0, row.get(0)?)?, row.get::<_, i64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut sweep = LeaseSweep::default();
        for (id, retry_count) in expired {
            // The status guard inside each CAS makes a lost race (result
            // reported between the select and here) a harmless no-op.
            if retry_count >= max_retries {
                if self.fail_task(id, Some("lease expired; retry budget exhausted"), now)? {
                    if let Some(task) = self.get_task(id)? {
                        sweep.failed.push(task);
                    }
                }
            } else if self.requeue_task(id, Some("lease expired"))? {
                if let Some(task) = self.get_task(id)? {
                    sweep.requeued.push(task);
                }
            }
        }
        Ok(sweep)
    }

    /// All tasks of an experiment, optionally filtered by action.
    pub fn tasks_for_experiment(
        &self,
        experiment_id: Uuid,
        action: Option<TaskAction>,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE experiment_id = ?1 AND (?2 IS NULL OR action = ?2)
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(
            params![experiment_id.to_string(), action.map(|a| a.as_str())],
            task_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Idempotence guard for task emission: does any task already exist for
    /// this (experiment, action, variant, host) tuple?
    pub fn has_task(
        &self,
        experiment_id: Uuid,
        action: TaskAction,
        variant: Option<Variant>,
        host_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM tasks
                 WHERE experiment_id = ?1 AND action = ?2
                   AND (variant IS ?3) AND host_id = ?4)",
            params![
                experiment_id.to_string(),
                action.as_str(),
                variant.map(|v| v.as_str()),
                host_id
            ],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    /// Non-terminal task count per host, for fleet status.
    pub fn active_task_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT host_id, COUNT(*) FROM tasks
             WHERE status IN ('pending', 'assigned', 'running')
             GROUP BY host_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
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
    use std::sync::Arc;

    fn new_task(host: &str, priority: i64) -> NewTask {
        NewTask {
            host_id: host.into(),
            experiment_id: None,
            action: TaskAction::Deploy,
            variant: Some(Variant::Baseline),
            config: json!({"pipeline": "p"}),
            priority,
        }
    }

    #[test]
    fn claim_orders_by_priority_then_fifo() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        let low_old = store.create_task(&new_task("h1", 0), t0).unwrap();
        let low_new = store
            .create_task(&new_task("h1", 0), t0 + chrono::Duration::seconds(1))
            .unwrap();
        let high = store
            .create_task(&new_task("h1", 10), t0 + chrono::Duration::seconds(2))
            .unwrap();

        let now = Utc::now();
        assert_eq!(store.claim_next_task("h1", now).unwrap().unwrap().id, high.id);
        assert_eq!(store.claim_next_task("h1", now).unwrap().unwrap().id, low_old.id);
        assert_eq!(store.claim_next_task("h1", now).unwrap().unwrap().id, low_new.id);
        assert!(store.claim_next_task("h1", now).unwrap().is_none());
    }

    #[test]
    fn claim_is_scoped_to_host() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.create_task(&new_task("h1", 0), now).unwrap();
        assert!(store.claim_next_task("h2", now).unwrap().is_none());
    }

    #[test]
    fn concurrent_claims_award_each_task_once() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();
        store.create_task(&new_task("h1", 0), now).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.claim_next_task("h1", Utc::now()).unwrap()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(wins, 1, "exactly one claimer may win");
    }

    #[test]
    fn status_never_reverses() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let task = store.create_task(&new_task("h1", 0), now).unwrap();

        // running before claim is rejected
        assert!(!store.mark_task_running(task.id, now).unwrap());

        let claimed = store.claim_next_task("h1", now).unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Assigned);
        assert!(store.mark_task_running(task.id, now).unwrap());
        assert!(store.complete_task(task.id, Some(&json!({"ok": true})), now).unwrap());

        // terminal: nothing else applies
        assert!(!store.complete_task(task.id, None, now).unwrap());
        assert!(!store.requeue_task(task.id, None).unwrap());
        assert!(!store.fail_task(task.id, None, now).unwrap());
        assert!(!store.mark_task_running(task.id, now).unwrap());

        let task = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap()["ok"], true);
    }

    #[test]
    fn lease_sweep_requeues_then_fails() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        let task = store.create_task(&new_task("h1", 0), t0).unwrap();
        let lease = chrono::Duration::seconds(30);

        // Claim, let the lease expire, sweep: requeued with retry_count 1.
        store.claim_next_task("h1", t0).unwrap().unwrap();
        let later = t0 + chrono::Duration::seconds(60);
        let sweep = store.sweep_expired_leases(lease, 1, later).unwrap();
        assert_eq!(sweep.requeued.len(), 1);
        assert_eq!(sweep.requeued[0].retry_count, 1);
        assert!(sweep.failed.is_empty());

        // Claim again, expire again: budget (1) exhausted, permanent failure.
        store.claim_next_task("h1", later).unwrap().unwrap();
        let even_later = later + chrono::Duration::seconds(60);
        let sweep = store.sweep_expired_leases(lease, 1, even_later).unwrap();
        assert!(sweep.requeued.is_empty());
        assert_eq!(sweep.failed.len(), 1);
        assert_eq!(
            store.get_task(task.id).unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[test]
    fn sweep_ignores_live_leases() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.create_task(&new_task("h1", 0), now).unwrap();
        store.claim_next_task("h1", now).unwrap().unwrap();
        let sweep = store
            .sweep_expired_leases(chrono::Duration::seconds(30), 3, now)
            .unwrap();
        assert!(sweep.requeued.is_empty() && sweep.failed.is_empty());
    }

    #[test]
    fn has_task_matches_exact_tuple() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let exp = Uuid::new_v4();
        let mut t = new_task("h1", 0);
        t.experiment_id = Some(exp);
        store.create_task(&t, now).unwrap();

        assert!(store
            .has_task(exp, TaskAction::Deploy, Some(Variant::Baseline), "h1")
            .unwrap());
        assert!(!store
            .has_task(exp, TaskAction::Deploy, Some(Variant::Candidate), "h1")
            .unwrap());
        assert!(!store
            .has_task(exp, TaskAction::Rollback, None, "h1")
            .unwrap());
        assert!(!store
            .has_task(exp, TaskAction::Deploy, Some(Variant::Baseline), "h2")
            .unwrap());
    }
}
