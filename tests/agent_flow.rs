//! End-to-end walk-through over real HTTP: a controller with a manual clock
//! serves two agent runners through a full experiment lifecycle, rollback
//! included.

use std::future::IntoFuture;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use pipelab::agent::{AgentRunner, TaskExecutor};
use pipelab::experiment::Clock;
use pipelab::model::{MetricPush, PushedSample, Variant};
use pipelab::server::{app_router, AppState};
use pipelab::{ControllerConfig, EventBroadcaster, ExperimentEngine, Store, TaskScheduler};

struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Succeeds at everything without touching the filesystem.
struct StubExecutor;

#[async_trait::async_trait]
impl TaskExecutor for StubExecutor {
    async fn execute(&self, task: &pipelab::model::Task) -> Result<Value, String> {
        Ok(json!({"action": task.action}))
    }
}

struct TestCluster {
    base_url: String,
    clock: Arc<ManualClock>,
    http: reqwest::Client,
}

async fn start_cluster() -> TestCluster {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = ControllerConfig {
        heartbeat_timeout_secs: 3600,
        ..Default::default()
    };
    let clock = Arc::new(ManualClock {
        now: Mutex::new(Utc::now()),
    });
    let scheduler = Arc::new(TaskScheduler::new(store.clone(), &config));
    let broadcaster = EventBroadcaster::new(64);
    let engine = Arc::new(ExperimentEngine::new(
        store.clone(),
        scheduler.clone(),
        broadcaster.clone(),
        &config,
        clock.clone(),
    ));
    let app = app_router(AppState::new(store, scheduler, engine, broadcaster, config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());

    TestCluster {
        base_url: format!("http://{addr}"),
        clock,
        http: reqwest::Client::new(),
    }
}

impl TestCluster {
    fn runner(&self, host_id: &str) -> AgentRunner {
        let config = pipelab::AgentConfig {
            controller_url: self.base_url.clone(),
            host_id: host_id.to_string(),
            hostname: format!("{host_id}.example"),
            ..Default::default()
        };
        AgentRunner::new(config, Arc::new(StubExecutor))
    }

    async fn post(&self, path: &str, body: Value) -> Value {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert!(
            response.status().is_success(),
            "POST {path} failed: {}",
            response.status()
        );
        response.json().await.unwrap()
    }

    async fn get(&self, path: &str) -> Value {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success(), "GET {path} failed");
        response.json().await.unwrap()
    }

    /// Force one reconcile pass and return the refreshed experiment.
    async fn tick(&self, id: &str) -> Value {
        self.post(&format!("/api/v1/experiments/{id}/start"), json!({}))
            .await
    }
}

/// Register, heartbeat, then handle every queued task for the host.
async fn drain(runner: &AgentRunner) -> usize {
    runner.register().await.unwrap();
    runner.heartbeat().await.unwrap();
    let mut handled = 0;
    while runner.poll_once().await.unwrap().is_some() {
        handled += 1;
    }
    handled
}

fn samples(n: usize) -> Vec<PushedSample> {
    (0..n)
        .map(|i| PushedSample {
            metric_name: "active_series".into(),
            value: 1.0,
            labels: json!({"route": format!("/api/{i}")}),
            recorded_at: None,
        })
        .collect()
}

#[tokio::test]
async fn full_experiment_lifecycle_over_http() {
    let cluster = start_cluster().await;
    let h1 = cluster.runner("h1");
    let h2 = cluster.runner("h2");

    let created = cluster
        .post(
            "/api/v1/experiments",
            json!({
                "name": "drop-high-cardinality-labels",
                "baseline_pipeline": {"name": "full"},
                "candidate_pipeline": {"name": "trimmed"},
                "target_hosts": ["h1", "h2"],
                "duration_secs": 600,
                "warmup_secs": 60,
            }),
        )
        .await;
    assert_eq!(created["phase"], "pending");
    let id = created["id"].as_str().unwrap().to_string();

    // Tick: deploy tasks fan out, two per host.
    assert_eq!(cluster.tick(&id).await["phase"], "deploying");
    assert_eq!(drain(&h1).await, 2);
    assert_eq!(cluster.tick(&id).await["phase"], "deploying");
    assert_eq!(drain(&h2).await, 2);
    let running = cluster.tick(&id).await;
    assert_eq!(running["phase"], "running");

    // Metrics: baseline 10 distinct series, candidate 3 — a 70% reduction.
    let inserted = h1
        .push_metrics(&MetricPush {
            experiment_id: id.parse().unwrap(),
            variant: Variant::Baseline,
            samples: samples(10),
        })
        .await
        .unwrap();
    assert_eq!(inserted, 10);
    h2.push_metrics(&MetricPush {
        experiment_id: id.parse().unwrap(),
        variant: Variant::Candidate,
        samples: samples(3),
    })
    .await
    .unwrap();

    // Collection window elapses.
    *cluster.clock.now.lock() += chrono::Duration::seconds(700);
    assert_eq!(cluster.tick(&id).await["phase"], "analyzing");
    let done = cluster.tick(&id).await;
    assert_eq!(done["phase"], "completed");

    let analysis = cluster
        .get(&format!("/api/v1/experiments/{id}/cost-analysis"))
        .await;
    assert!((analysis["reduction_percent"].as_f64().unwrap() - 70.0).abs() < 1e-9);
    assert_eq!(analysis["baseline_cardinality"], 10);
    assert_eq!(analysis["candidate_cardinality"], 3);

    // One event per transition, in order, with strictly increasing seq.
    let events = cluster
        .get(&format!("/api/v1/experiments/{id}/events"))
        .await;
    let events = events["events"].as_array().unwrap().clone();
    let phases: Vec<&str> = events
        .iter()
        .map(|e| e["phase"].as_str().unwrap())
        .collect();
    assert_eq!(
        phases,
        vec!["pending", "deploying", "running", "analyzing", "completed"]
    );
    let seqs: Vec<i64> = events.iter().map(|e| e["seq"].as_i64().unwrap()).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn rollback_over_http_freezes_after_all_hosts_revert() {
    let cluster = start_cluster().await;
    let h1 = cluster.runner("h1");
    let h2 = cluster.runner("h2");

    let created = cluster
        .post(
            "/api/v1/experiments",
            json!({
                "name": "aborted-run",
                "baseline_pipeline": {"name": "full"},
                "candidate_pipeline": {"name": "trimmed"},
                "target_hosts": ["h1", "h2"],
                "duration_secs": 600,
            }),
        )
        .await;
    let id = created["id"].as_str().unwrap().to_string();

    cluster.tick(&id).await;
    drain(&h1).await;
    drain(&h2).await;
    assert_eq!(cluster.tick(&id).await["phase"], "running");

    // Stop is rollback-flavored.
    let stopped = cluster
        .post(&format!("/api/v1/experiments/{id}/stop"), json!({}))
        .await;
    assert_eq!(stopped["phase"], "running", "not frozen until hosts revert");

    assert_eq!(drain(&h1).await, 1, "one rollback task for h1");
    assert_eq!(cluster.tick(&id).await["phase"], "running");

    assert_eq!(drain(&h2).await, 1, "one rollback task for h2");
    assert_eq!(cluster.tick(&id).await["phase"], "rolled_back");

    // Fleet view shows both agents healthy and idle again.
    let fleet = cluster.get("/api/v1/fleet/status").await;
    assert_eq!(fleet["total"], 2);
    assert_eq!(fleet["degraded"], false);
}
