//! Agent rows: registration upsert, heartbeat, staleness marking.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::{fmt_ts, parse_enum, parse_json, parse_ts, parse_ts_opt, Store};
use crate::errors::StoreError;
use crate::model::{AgentRecord, AgentStatus};

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        host_id: row.get(0)?,
        hostname: row.get(1)?,
        status: parse_enum(2, &row.get::<_, String>(2)?, AgentStatus::parse)?,
        last_heartbeat: parse_ts_opt(3, row.get(3)?)?,
        capabilities: parse_json(4, row.get(4)?).map(|v| {
            v.as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|c| c.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        })?,
        resource_usage: parse_json(5, row.get(5)?)?,
        registered_at: parse_ts(6, row.get(6)?)?,
    })
}

const AGENT_COLUMNS: &str =
    "host_id, hostname, status, last_heartbeat, capabilities, resource_usage, registered_at";

impl Store {
    /// Register an agent. Re-registration refreshes hostname/capabilities
    /// but keeps heartbeat state; agent rows are never deleted.
    pub fn register_agent(
        &self,
        host_id: &str,
        hostname: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO agents (host_id, hostname, status, capabilities, registered_at)
             VALUES (?1, ?2, 'unknown', ?3, ?4)
             ON CONFLICT (host_id) DO UPDATE SET
                 hostname = excluded.hostname,
                 capabilities = excluded.capabilities",
            params![
                host_id,
                hostname,
                serde_json::to_string(capabilities)?,
                fmt_ts(now)
            ],
        )?;
        drop(conn);
        self.get_agent(host_id)?
            .ok_or_else(|| StoreError::not_found("agent", host_id))
    }

    /// Record a heartbeat. Upserts by host_id so an unregistered sender is
    /// tolerated, and takes MAX over timestamps so out-of-order heartbeats
    /// never move `last_heartbeat` backwards.
    pub fn record_heartbeat(
        &self,
        host_id: &str,
        status: AgentStatus,
        resource_usage: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts = fmt_ts(now);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO agents (host_id, hostname, status, last_heartbeat, resource_usage, registered_at)
             VALUES (?1, ?1, ?2, ?3, ?4, ?3)
             ON CONFLICT (host_id) DO UPDATE SET
                 status = excluded.status,
                 resource_usage = excluded.resource_usage,
                 last_heartbeat = CASE
                     WHEN agents.last_heartbeat IS NULL OR agents.last_heartbeat < excluded.last_heartbeat
                     THEN excluded.last_heartbeat
                     ELSE agents.last_heartbeat
                 END",
            params![host_id, status.as_str(), ts, serde_json::to_string(resource_usage)?],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, host_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let conn = self.conn();
        let agent = conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE host_id = ?1"),
                params![host_id],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY host_id"))?;
        let rows = stmt.query_map([], agent_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mark healthy agents whose heartbeat fell outside the window as
    /// unhealthy. Run from the reconciliation tick.
    pub fn mark_stale_agents(
        &self,
        heartbeat_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = fmt_ts(now - heartbeat_timeout);
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE agents SET status = 'unhealthy'
             WHERE status = 'healthy'
               AND (last_heartbeat IS NULL OR last_heartbeat < ?1)",
            params![cutoff],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registration_upsert_keeps_heartbeat_state() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let agent = store
            .register_agent("h1", "h1.example", &["deploy".into()], now)
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Unknown);

        store
            .record_heartbeat("h1", AgentStatus::Healthy, &json!({"cpu": 0.2}), now)
            .unwrap();
        // Re-register: heartbeat survives, hostname refreshes.
        let agent = store
            .register_agent("h1", "h1.internal", &["deploy".into()], now)
            .unwrap();
        assert_eq!(agent.hostname, "h1.internal");
        assert_eq!(agent.status, AgentStatus::Healthy);
        assert!(agent.last_heartbeat.is_some());
    }

    #[test]
    fn out_of_order_heartbeats_never_regress() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        store
            .record_heartbeat("h1", AgentStatus::Healthy, &json!({}), t1)
            .unwrap();
        store
            .record_heartbeat("h1", AgentStatus::Healthy, &json!({}), t0)
            .unwrap();

        let agent = store.get_agent("h1").unwrap().unwrap();
        assert_eq!(agent.last_heartbeat.unwrap(), t1);
    }

    #[test]
    fn stale_agents_marked_unhealthy() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        store
            .record_heartbeat("fresh", AgentStatus::Healthy, &json!({}), t0)
            .unwrap();
        store
            .record_heartbeat("stale", AgentStatus::Healthy, &json!({}), t0 - chrono::Duration::seconds(300))
            .unwrap();

        let marked = store
            .mark_stale_agents(chrono::Duration::seconds(60), t0)
            .unwrap();
        assert_eq!(marked, 1);
        assert_eq!(
            store.get_agent("stale").unwrap().unwrap().status,
            AgentStatus::Unhealthy
        );
        assert_eq!(
            store.get_agent("fresh").unwrap().unwrap().status,
            AgentStatus::Healthy
        );
    }
}
