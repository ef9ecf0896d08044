//! Metrics & cost aggregation.
//!
//! Read-only over the metric cache: computes per-metric cardinality
//! (distinct label-set count) for baseline vs candidate and the resulting
//! cost-delta percentage. Never mutates samples; produces a derived result
//! the state machine caches on the experiment row.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::model::{Experiment, Variant};
use crate::store::Store;

/// Per-metric cardinality comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricReduction {
    pub metric_name: String,
    pub baseline_cardinality: i64,
    pub candidate_cardinality: i64,
    /// `1 - candidate/baseline`, as a percentage. `None` when the baseline
    /// has no data for this metric (abstain rather than divide by zero).
    pub reduction_percent: Option<f64>,
}

/// Aggregated cost analysis for one experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAnalysis {
    pub experiment_id: Uuid,
    pub per_metric: Vec<MetricReduction>,
    pub baseline_cardinality: i64,
    pub candidate_cardinality: i64,
    /// Overall cardinality reduction percentage; 0 when the baseline is
    /// empty (in which case `partial` is set).
    pub reduction_percent: f64,
    /// Cost tracks active series count, so the estimated savings follow the
    /// cardinality reduction directly.
    pub estimated_cost_savings_percent: f64,
    /// Set when some targeted hosts never reported or a metric lacks
    /// baseline data; the analysis covers whatever samples exist.
    pub partial: bool,
    pub computed_at: DateTime<Utc>,
}

/// Compute the cost analysis for an experiment.
///
/// Returns `Ok(None)` when no samples exist at all — "no data" is not a
/// result, and the caller's bounded retry loop decides when to give up.
/// Partial data (missing hosts, zero-baseline metrics) produces a result
/// with `partial: true` instead of an error.
pub fn compute_cost_analysis(
    store: &Store,
    experiment: &Experiment,
    now: DateTime<Utc>,
) -> Result<Option<CostAnalysis>, StoreError> {
    let rows = store.cardinality_rows(experiment.id)?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut by_metric: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    for row in rows {
        let entry = by_metric.entry(row.metric_name).or_insert((0, 0));
        match row.variant {
            Variant::Baseline => entry.0 = row.cardinality,
            Variant::Candidate => entry.1 = row.cardinality,
        }
    }

    let mut per_metric = Vec::with_capacity(by_metric.len());
    let mut baseline_total = 0i64;
    let mut candidate_total = 0i64;
    let mut missing_baseline = false;

    for (metric_name, (baseline, candidate)) in by_metric {
        baseline_total += baseline;
        candidate_total += candidate;
        let reduction_percent = if baseline > 0 {
            Some((1.0 - candidate as f64 / baseline as f64) * 100.0)
        } else {
            missing_baseline = true;
            None
        };
        per_metric.push(MetricReduction {
            metric_name,
            baseline_cardinality: baseline,
            candidate_cardinality: candidate,
            reduction_percent,
        });
    }

    let reduction_percent = if baseline_total > 0 {
        (1.0 - candidate_total as f64 / baseline_total as f64) * 100.0
    } else {
        0.0
    };

    let reporting = store.reporting_hosts(experiment.id)?;
    let missing_hosts = experiment
        .target_hosts
        .iter()
        .any(|h| !reporting.contains(h));

    Ok(Some(CostAnalysis {
        experiment_id: experiment.id,
        per_metric,
        baseline_cardinality: baseline_total,
        candidate_cardinality: candidate_total,
        reduction_percent,
        estimated_cost_savings_percent: reduction_percent,
        partial: baseline_total == 0 || missing_baseline || missing_hosts,
        computed_at: now,
    }))
}
