//! ---
//! cc_section: "05-networking-external-interfaces"
//! cc_subsection: "tests"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "REST surface tests against a live server."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chaoscraft_api::{spawn_api_server, ApiServer, ApiState};
use chaoscraft_common::VersionInfo;
use chaoscraft_core::{
    EffectError, EngineSettings, LifecycleEngine, RetryPolicy, ScriptedExecutor,
};
use chaoscraft_metrics::new_registry;
use chaoscraft_store::{ExperimentStore, MemoryStore};
use reqwest::StatusCode;
use serde_json::{json, Value};

struct Harness {
    server: ApiServer,
    base: String,
    client: reqwest::Client,
    executor: Arc<ScriptedExecutor>,
}

impl Harness {
    async fn start(executor: ScriptedExecutor, with_metrics: bool) -> Self {
        Self::start_with_store(executor, with_metrics, Arc::new(MemoryStore::new())).await
    }

    async fn start_with_store(
        executor: ScriptedExecutor,
        with_metrics: bool,
        store: Arc<dyn ExperimentStore>,
    ) -> Self {
        Self::launch(
            executor,
            with_metrics,
            store,
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
        .await
    }

    async fn launch(
        executor: ScriptedExecutor,
        with_metrics: bool,
        store: Arc<dyn ExperimentStore>,
        effect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let executor = Arc::new(executor);
        let engine = Arc::new(LifecycleEngine::new(
            store,
            executor.clone(),
            EngineSettings {
                retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::ZERO),
                effect_timeout,
            },
        ));
        let mut state = ApiState::new(engine, VersionInfo::current());
        if with_metrics {
            state = state.with_metrics(new_registry()).unwrap();
        }
        let server = spawn_api_server(
            Arc::new(state),
            "127.0.0.1:0".parse().unwrap(),
            request_timeout,
        )
        .unwrap();
        let base = format!("http://{}", server.addr());
        Self {
            server,
            base,
            client: reqwest::Client::new(),
            executor,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn create(&self, body: &Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(self.url("/api/v1/experiments"))
            .json(body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn post(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.post(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }
}

fn latency_spec(name: &str) -> Value {
    json!({
        "name": name,
        "fault": {"type": "network_latency", "latency_ms": 300},
        "target": {"labels": {"app": "search"}},
        "duration_sec": 600
    })
}

#[tokio::test]
async fn experiment_lifecycle_over_http() {
    let harness = Harness::start(ScriptedExecutor::new(), false).await;

    let (status, created) = harness.create(&latency_spec("search latency")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["state"], "pending");
    assert_eq!(created["version"], 1);
    let id = created["id"].as_str().unwrap().to_owned();

    let (status, running) = harness
        .post(&format!("/api/v1/experiments/{id}/start"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(running["state"], "running");
    assert_eq!(running["version"], 3);

    let (status, fetched) = harness.get(&format!("/api/v1/experiments/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, running);

    let (status, body) = harness
        .post(&format!("/api/v1/experiments/{id}/start"))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "conflict");
    assert_eq!(body["error"]["retryable"], false);

    let (status, stopped) = harness.post(&format!("/api/v1/experiments/{id}/stop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["state"], "stopped");
    assert_eq!(stopped["version"], 5);

    let response = harness
        .client
        .delete(harness.url(&format!("/api/v1/experiments/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], id.as_str());

    let (status, body) = harness.get(&format!("/api/v1/experiments/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");

    harness.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn effect_failure_returns_bad_gateway_with_record() {
    let executor = ScriptedExecutor::new();
    executor.script_apply(Err(EffectError::unknown("agent returned 500")));
    let harness = Harness::start(executor, false).await;

    let (_, created) = harness.create(&latency_spec("flaky agent")).await;
    let id = created["id"].as_str().unwrap();
    let (status, body) = harness
        .post(&format!("/api/v1/experiments/{id}/start"))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["kind"], "effect");
    assert_eq!(body["experiment"]["state"], "failed");
    assert_eq!(body["experiment"]["version"], 3);
    assert_eq!(
        body["experiment"]["last_error"]["unknown_effect_state"],
        true
    );
    assert_eq!(harness.executor.calls().len(), 1);
}

#[tokio::test]
async fn validation_and_malformed_requests() {
    let harness = Harness::start(ScriptedExecutor::new(), false).await;

    let (status, body) = harness
        .create(&json!({
            "name": "",
            "fault": {"type": "cpu_stress", "cores": 0, "load_percent": 50},
            "target": {}
        }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
    assert_eq!(body["error"]["problems"].as_array().unwrap().len(), 3);

    let (status, body) = harness
        .create(&json!({"name": "x", "fault": {"type": "meteor_strike"}, "target": {}}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");

    let (status, body) = harness.get("/api/v1/experiments/not-a-uuid").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");

    let (status, _) = harness.get("/api/v1/experiments?state=paused").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = harness.get("/api/v1/experiments?limit=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn idempotency_key_replays_create() {
    let harness = Harness::start(ScriptedExecutor::new(), false).await;
    let send = |body: Value| {
        harness
            .client
            .post(harness.url("/api/v1/experiments"))
            .header("Idempotency-Key", "rollout-19")
            .json(&body)
            .send()
    };

    let first = send(latency_spec("keyed")).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(first.headers().get("idempotent-replayed").is_none());
    let first: Value = first.json().await.unwrap();

    let replay = send(latency_spec("keyed")).await.unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(
        replay.headers().get("idempotent-replayed").unwrap(),
        "true"
    );
    let replay: Value = replay.json().await.unwrap();
    assert_eq!(replay["id"], first["id"]);

    let mismatch = send(latency_spec("other")).await.unwrap();
    assert_eq!(mismatch.status(), StatusCode::CONFLICT);
    let body: Value = mismatch.json().await.unwrap();
    assert_eq!(body["error"]["reason"], "idempotency_mismatch");

    let (_, list) = harness.get("/api/v1/experiments").await;
    assert_eq!(list["total"], 1);
}

#[tokio::test]
async fn list_filters_by_state_and_limit() {
    let harness = Harness::start(ScriptedExecutor::new(), false).await;
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let (_, created) = harness.create(&latency_spec(name)).await;
        ids.push(created["id"].as_str().unwrap().to_owned());
    }
    harness
        .post(&format!("/api/v1/experiments/{}/start", ids[1]))
        .await;

    let (status, running) = harness.get("/api/v1/experiments?state=running").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(running["total"], 1);
    assert_eq!(running["experiments"][0]["id"], ids[1].as_str());

    let (_, limited) = harness.get("/api/v1/experiments?limit=2").await;
    assert_eq!(limited["total"], 3);
    assert_eq!(limited["experiments"].as_array().unwrap().len(), 2);
    assert_eq!(limited["experiments"][0]["id"], ids[2].as_str());

    let (_, pending) = harness
        .get("/api/v1/experiments?state=pending&limit=1")
        .await;
    assert_eq!(pending["total"], 2);
    assert_eq!(pending["experiments"].as_array().unwrap().len(), 1);
    assert_eq!(pending["experiments"][0]["id"], ids[2].as_str());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_start_requests_yield_one_success() {
    let executor = ScriptedExecutor::new().with_delay(Duration::from_millis(100));
    let harness = Harness::start(executor, false).await;
    let (_, created) = harness.create(&latency_spec("contended")).await;
    let id = created["id"].as_str().unwrap().to_owned();

    let requests = (0..6).map(|_| {
        harness
            .client
            .post(harness.url(&format!("/api/v1/experiments/{id}/start")))
            .send()
    });
    let statuses: Vec<StatusCode> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|response| response.unwrap().status())
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 1);
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == StatusCode::CONFLICT)
            .count(),
        5
    );
    assert_eq!(harness.executor.calls().len(), 1);
}

#[tokio::test]
async fn operational_endpoints() {
    let harness = Harness::start(ScriptedExecutor::new(), true).await;

    let (status, health) = harness.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");

    let (status, ready) = harness.get("/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ready["store"], "memory");

    let (status, version) = harness.get("/api/v1/version").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(version["executor"], "scripted");
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));

    let response = harness
        .client
        .get(harness.url("/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains(
        "chaoscraft_http_requests_total{method=\"GET\",path=\"/health\",status=\"200\"} 1"
    ));
    assert!(body.contains("path=\"/api/v1/version\""));
}

#[tokio::test]
async fn metrics_endpoint_unavailable_without_registry() {
    let harness = Harness::start(ScriptedExecutor::new(), false).await;
    let response = harness
        .client
        .get(harness.url("/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn slow_transition_times_out_with_json_error_and_still_settles() {
    let harness = Harness::launch(
        ScriptedExecutor::new().with_delay(Duration::from_millis(400)),
        true,
        Arc::new(MemoryStore::new()),
        Duration::from_millis(300),
        Duration::from_millis(200),
    )
    .await;
    let (_, created) = harness.create(&latency_spec("slow agent")).await;
    let id = created["id"].as_str().unwrap().to_owned();

    let (status, body) = harness
        .post(&format!("/api/v1/experiments/{id}/start"))
        .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["kind"], "timeout");
    assert_eq!(body["error"]["retryable"], true);

    let mut settled = Value::Null;
    for _ in 0..50 {
        let (_, record) = harness.get(&format!("/api/v1/experiments/{id}")).await;
        if record["state"] != "starting" {
            settled = record;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(settled["state"], "failed");
    assert_eq!(settled["version"], 3);
    assert_eq!(settled["last_error"]["unknown_effect_state"], true);
    assert_eq!(harness.executor.calls().len(), 1);

    let metrics = harness
        .client
        .get(harness.url("/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains(
        "chaoscraft_http_requests_total{method=\"POST\",path=\"/api/v1/experiments/:id/start\",status=\"504\"} 1"
    ));
}
