//! Axum route handlers for the controller HTTP server.
//!
//! # Routes
//!
//! - `GET  /health`                                    — liveness probe
//! - `POST /api/v1/experiments`                        — create experiment
//! - `GET  /api/v1/experiments`                        — list experiments
//! - `GET  /api/v1/experiments/{id}`                   — get one experiment
//! - `POST /api/v1/experiments/{id}/start`             — reconcile now
//! - `POST /api/v1/experiments/{id}/stop`              — stop (rollback)
//! - `POST /api/v1/experiments/{id}/rollback`          — request rollback
//! - `GET  /api/v1/experiments/{id}/metrics`           — sample summary
//! - `GET  /api/v1/experiments/{id}/cost-analysis`     — cost analysis
//! - `GET  /api/v1/experiments/{id}/events`            — event log (polling)
//! - `POST /api/v1/agents/register`                    — register agent
//! - `POST /api/v1/agents/{id}/heartbeat`              — heartbeat
//! - `GET  /api/v1/agents/{id}/tasks`                  — poll (claim) a task
//! - `POST /api/v1/agents/{id}/tasks/{task_id}/start`  — mark task running
//! - `POST /api/v1/agents/{id}/tasks/{task_id}/result` — report result
//! - `POST /api/v1/agents/{id}/metrics`                — push metric samples
//! - `GET  /api/v1/fleet/status`                       — fleet health view
//! - `GET  /api/v1/pipelines`                          — known pipeline refs
//! - `POST /api/v1/pipelines/validate`                 — shape-check a blob
//! - `GET  /ws`                                        — event WebSocket

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::broadcast::EventBroadcaster;
use crate::config::ControllerConfig;
use crate::errors::{ExperimentError, SchedulerError, StoreError};
use crate::experiment::ExperimentEngine;
use crate::metrics::compute_cost_analysis;
use crate::model::{AgentRegistration, Heartbeat, MetricPush, NewExperiment, TaskReport, Variant};
use crate::scheduler::TaskScheduler;
use crate::store::Store;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub scheduler: Arc<TaskScheduler>,
    pub engine: Arc<ExperimentEngine>,
    pub broadcaster: EventBroadcaster,
    pub config: ControllerConfig,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<TaskScheduler>,
        engine: Arc<ExperimentEngine>,
        broadcaster: EventBroadcaster,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            engine,
            broadcaster,
            config,
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/v1/experiments",
            get(list_experiments_handler).post(create_experiment_handler),
        )
        .route("/api/v1/experiments/{id}", get(get_experiment_handler))
        .route("/api/v1/experiments/{id}/start", post(start_experiment_handler))
        .route("/api/v1/experiments/{id}/stop", post(rollback_experiment_handler))
        .route("/api/v1/experiments/{id}/rollback", post(rollback_experiment_handler))
        .route("/api/v1/experiments/{id}/metrics", get(experiment_metrics_handler))
        .route(
            "/api/v1/experiments/{id}/cost-analysis",
            get(cost_analysis_handler),
        )
        .route("/api/v1/experiments/{id}/events", get(experiment_events_handler))
        .route("/api/v1/agents/register", post(register_agent_handler))
        .route("/api/v1/agents/{id}/heartbeat", post(heartbeat_handler))
        .route("/api/v1/agents/{id}/tasks", get(poll_tasks_handler))
        .route(
            "/api/v1/agents/{id}/tasks/{task_id}/start",
            post(task_start_handler),
        )
        .route(
            "/api/v1/agents/{id}/tasks/{task_id}/result",
            post(task_result_handler),
        )
        .route("/api/v1/agents/{id}/metrics", post(push_metrics_handler))
        .route("/api/v1/fleet/status", get(fleet_status_handler))
        .route("/api/v1/pipelines", get(list_pipelines_handler))
        .route("/api/v1/pipelines/validate", post(validate_pipeline_handler))
        .route("/ws", get(super::ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound { .. } => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string()})),
        ),
        _ => {
            tracing::error!(error = %e, "store error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

fn experiment_error(e: ExperimentError) -> ApiError {
    match e {
        ExperimentError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string()})),
        ),
        ExperimentError::Invalid(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
        ExperimentError::InvalidPhase { .. } => (
            StatusCode::CONFLICT,
            Json(json!({"error": e.to_string()})),
        ),
        ExperimentError::Store(e) => store_error(e),
    }
}

fn scheduler_error(e: SchedulerError) -> ApiError {
    match e {
        SchedulerError::UnknownTask(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string()})),
        ),
        SchedulerError::Store(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "pipelab",
    }))
}

// ---------------------------------------------------------------------------
// Experiments
// ---------------------------------------------------------------------------

/// POST /api/v1/experiments — create an experiment in `pending`.
async fn create_experiment_handler(
    State(state): State<AppState>,
    Json(req): Json<NewExperiment>,
) -> Result<impl IntoResponse, ApiError> {
    let exp = state
        .engine
        .create_experiment(&req)
        .map_err(experiment_error)?;
    Ok((StatusCode::CREATED, Json(exp)))
}

/// GET /api/v1/experiments — list all experiments, newest first.
async fn list_experiments_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let experiments = state.store.list_experiments().map_err(store_error)?;
    Ok(Json(json!({ "experiments": experiments })))
}

/// GET /api/v1/experiments/{id}
async fn get_experiment_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let exp = state
        .store
        .get_experiment(id)
        .map_err(store_error)?
        .ok_or_else(|| store_error(StoreError::not_found("experiment", id)))?;
    Ok(Json(serde_json::to_value(exp).map_err(|e| store_error(e.into()))?))
}

/// POST /api/v1/experiments/{id}/start — run one reconcile pass immediately
/// instead of waiting for the next periodic tick.
async fn start_experiment_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.engine.reconcile(id).map_err(experiment_error)?;
    let exp = state
        .store
        .get_experiment(id)
        .map_err(store_error)?
        .ok_or_else(|| store_error(StoreError::not_found("experiment", id)))?;
    Ok(Json(serde_json::to_value(exp).map_err(|e| store_error(e.into()))?))
}

/// POST /api/v1/experiments/{id}/stop and .../rollback — both end the
/// comparison by reverting every targeted host; the phase freezes at
/// `rolled_back` once all rollback tasks complete.
async fn rollback_experiment_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let exp = state.engine.request_rollback(id).map_err(experiment_error)?;
    Ok(Json(serde_json::to_value(exp).map_err(|e| store_error(e.into()))?))
}

/// GET /api/v1/experiments/{id}/metrics — per-variant sample counts and the
/// cardinality breakdown over whatever has been pushed so far.
async fn experiment_metrics_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .get_experiment(id)
        .map_err(store_error)?
        .ok_or_else(|| store_error(StoreError::not_found("experiment", id)))?;

    let samples = state.store.samples_for_experiment(id).map_err(store_error)?;
    let baseline = samples
        .iter()
        .filter(|s| s.variant == Variant::Baseline)
        .count();
    let cardinality = state.store.cardinality_rows(id).map_err(store_error)?;
    let reporting_hosts = state.store.reporting_hosts(id).map_err(store_error)?;

    Ok(Json(json!({
        "experiment_id": id,
        "sample_count": samples.len(),
        "baseline_samples": baseline,
        "candidate_samples": samples.len() - baseline,
        "reporting_hosts": reporting_hosts,
        "cardinality": cardinality,
    })))
}

/// GET /api/v1/experiments/{id}/cost-analysis — the cached result when the
/// experiment completed, otherwise a fresh aggregation over current samples.
async fn cost_analysis_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let exp = state
        .store
        .get_experiment(id)
        .map_err(store_error)?
        .ok_or_else(|| store_error(StoreError::not_found("experiment", id)))?;

    if let Some(cached) = exp.cost_analysis.clone() {
        return Ok(Json(cached));
    }

    match compute_cost_analysis(&state.store, &exp, Utc::now()).map_err(store_error)? {
        Some(analysis) => Ok(Json(
            serde_json::to_value(analysis).map_err(|e| store_error(e.into()))?,
        )),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no metric samples for experiment {id} yet")})),
        )),
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: i64,
}

/// GET /api/v1/experiments/{id}/events?after=N — polling alternative to the
/// WebSocket stream, same replay cursor semantics.
async fn experiment_events_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = state
        .store
        .events_after(id, query.after)
        .map_err(store_error)?;
    Ok(Json(json!({ "events": events })))
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// POST /api/v1/agents/register — idempotent upsert by host_id.
async fn register_agent_handler(
    State(state): State<AppState>,
    Json(req): Json<AgentRegistration>,
) -> Result<Json<Value>, ApiError> {
    if req.host_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "host_id must not be empty"})),
        ));
    }
    let agent = state
        .store
        .register_agent(&req.host_id, &req.hostname, &req.capabilities, Utc::now())
        .map_err(store_error)?;
    tracing::info!(host_id = %req.host_id, hostname = %req.hostname, "agent registered");
    Ok(Json(serde_json::to_value(agent).map_err(|e| store_error(e.into()))?))
}

/// POST /api/v1/agents/{id}/heartbeat — upsert liveness. Out-of-order
/// heartbeats are tolerated; the stored timestamp never moves backwards.
async fn heartbeat_handler(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(req): Json<Heartbeat>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .record_heartbeat(&host_id, req.status, &req.resource_usage, Utc::now())
        .map_err(store_error)?;
    Ok(Json(json!({"status": "ok"})))
}

/// GET /api/v1/agents/{id}/tasks — the poll. Claims at most one task;
/// `task` is null when nothing is pending or the agent is ineligible.
async fn poll_tasks_handler(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .scheduler
        .claim_next(&host_id, Utc::now())
        .map_err(scheduler_error)?;
    Ok(Json(json!({ "task": task })))
}

/// POST /api/v1/agents/{id}/tasks/{task_id}/start — the agent signals that
/// execution began; `started_at` is recorded for lease accounting.
async fn task_start_handler(
    State(state): State<AppState>,
    Path((_host_id, task_id)): Path<(String, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .scheduler
        .mark_running(task_id, Utc::now())
        .map_err(scheduler_error)?;
    Ok(Json(serde_json::to_value(task).map_err(|e| store_error(e.into()))?))
}

/// POST /api/v1/agents/{id}/tasks/{task_id}/result — completion or failure.
/// Duplicate reports for a terminal task are acknowledged as no-ops.
async fn task_result_handler(
    State(state): State<AppState>,
    Path((_host_id, task_id)): Path<(String, Uuid)>,
    Json(report): Json<TaskReport>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .scheduler
        .report_result(task_id, &report, Utc::now())
        .map_err(scheduler_error)?;
    Ok(Json(serde_json::to_value(task).map_err(|e| store_error(e.into()))?))
}

/// POST /api/v1/agents/{id}/metrics — append-only sample ingest.
async fn push_metrics_handler(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(push): Json<MetricPush>,
) -> Result<Json<Value>, ApiError> {
    let inserted = state
        .store
        .insert_samples(
            push.experiment_id,
            push.variant,
            &host_id,
            &push.samples,
            Utc::now(),
        )
        .map_err(store_error)?;
    tracing::debug!(
        experiment_id = %push.experiment_id,
        host_id,
        inserted,
        "metric samples ingested"
    );
    Ok(Json(json!({"inserted": inserted})))
}

// ---------------------------------------------------------------------------
// Fleet & pipelines
// ---------------------------------------------------------------------------

/// GET /api/v1/fleet/status — per-agent health with staleness and active
/// task counts; `degraded` is set when any agent is outside its window.
async fn fleet_status_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let timeout = state.config.heartbeat_timeout();
    let agents = state.store.list_agents().map_err(store_error)?;
    let counts: std::collections::HashMap<String, i64> = state
        .store
        .active_task_counts()
        .map_err(store_error)?
        .into_iter()
        .collect();

    let mut degraded = false;
    let entries: Vec<Value> = agents
        .iter()
        .map(|a| {
            let eligible = a.is_eligible(now, timeout);
            if !eligible {
                degraded = true;
            }
            json!({
                "host_id": a.host_id,
                "hostname": a.hostname,
                "status": a.status,
                "last_heartbeat": a.last_heartbeat,
                "eligible": eligible,
                "active_tasks": counts.get(&a.host_id).copied().unwrap_or(0),
                "capabilities": a.capabilities,
                "resource_usage": a.resource_usage,
            })
        })
        .collect();

    Ok(Json(json!({
        "agents": entries,
        "total": entries.len(),
        "degraded": degraded,
    })))
}

/// GET /api/v1/pipelines — distinct pipeline configurations referenced by
/// experiments.
async fn list_pipelines_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let pipelines = state.store.list_pipelines().map_err(store_error)?;
    Ok(Json(json!({ "pipelines": pipelines })))
}

/// POST /api/v1/pipelines/validate — shape-check an opaque pipeline blob.
/// The core only requires a non-empty JSON object with a `name`; everything
/// else is validated at the agent-execution boundary.
async fn validate_pipeline_handler(Json(body): Json<Value>) -> Json<Value> {
    let mut errors = Vec::new();
    match body.as_object() {
        None => errors.push("pipeline must be a JSON object".to_string()),
        Some(obj) => {
            if obj.is_empty() {
                errors.push("pipeline must not be empty".to_string());
            }
            if !obj.get("name").map(Value::is_string).unwrap_or(false) {
                errors.push("pipeline must carry a string 'name'".to_string());
            }
        }
    }
    Json(json!({
        "valid": errors.is_empty(),
        "errors": errors,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
