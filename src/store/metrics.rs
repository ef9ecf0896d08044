//! Metric cache: append-only sample ingestion and cardinality queries.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use super::{fmt_ts, parse_enum, parse_json, parse_ts, parse_uuid, Store};
use crate::errors::StoreError;
use crate::model::{MetricSample, PushedSample, Variant};

/// Per-(metric, variant) aggregate used by the cost aggregator and the
/// metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CardinalityRow {
    pub metric_name: String,
    pub variant: Variant,
    pub samples: i64,
    /// Count of distinct canonical label sets.
    pub cardinality: i64,
}

impl Store {
    /// Append a batch of pushed samples. Labels are canonicalized (sorted
    /// object keys) so `COUNT(DISTINCT labels)` counts label *sets*, not
    /// encodings. Rows are never mutated after insert.
    pub fn insert_samples(
        &self,
        experiment_id: Uuid,
        variant: Variant,
        host_id: &str,
        samples: &[PushedSample],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_cache
                     (experiment_id, recorded_at, metric_name, variant, host_id, value, labels)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    experiment_id.to_string(),
                    fmt_ts(sample.recorded_at.unwrap_or(now)),
                    sample.metric_name,
                    variant.as_str(),
                    host_id,
                    sample.value,
                    // serde_json maps use sorted keys, so this string is canonical.
                    serde_json::to_string(&sample.labels)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(samples.len())
    }

    /// Cardinality and sample counts per (metric, variant).
    pub fn cardinality_rows(
        &self,
        experiment_id: Uuid,
    ) -> Result<Vec<CardinalityRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT metric_name, variant, COUNT(*), COUNT(DISTINCT labels)
             FROM metric_cache
             WHERE experiment_id = ?1
             GROUP BY metric_name, variant
             ORDER BY metric_name, variant",
        )?;
        let rows = stmt.query_map(params![experiment_id.to_string()], |row| {
            Ok(CardinalityRow {
                metric_name: row.get(0)?,
                variant: parse_enum(1, &row.get::<_, String>(1)?, Variant::parse)?,
                samples: row.get(2)?,
                cardinality: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Hosts that have pushed at least one sample for the experiment.
    pub fn reporting_hosts(&self, experiment_id: Uuid) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT host_id FROM metric_cache WHERE experiment_id = ?1 ORDER BY host_id",
        )?;
        let rows = stmt.query_map(params![experiment_id.to_string()], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Raw samples for an experiment, oldest first.
    pub fn samples_for_experiment(
        &self,
        experiment_id: Uuid,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT experiment_id, recorded_at, metric_name, variant, host_id, value, labels
             FROM metric_cache
             WHERE experiment_id = ?1
             ORDER BY recorded_at, id",
        )?;
        let rows = stmt.query_map(params![experiment_id.to_string()], |row| {
            Ok(MetricSample {
                experiment_id: parse_uuid(0, row.get(0)?)?,
                recorded_at: parse_ts(1, row.get(1)?)?,
                metric_name: row.get(2)?,
                variant: parse_enum(3, &row.get::<_, String>(3)?, Variant::parse)?,
                host_id: row.get(4)?,
                value: row.get(5)?,
                labels: parse_json(6, row.get(6)?)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
