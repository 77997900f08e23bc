use std::sync::Arc;

use orchestrator_api::app;
use orchestrator_core::SystemClock;
use orchestrator_infra::admission::TenantDefaults;
use orchestrator_infra::OrchestratorConfig;
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(OrchestratorConfig {
            tenant_defaults: TenantDefaults {
                concurrency: 16,
                rps: 1_000,
                token_budget_per_min: 1_000_000,
            },
            ..OrchestratorConfig::default()
        })
        .await
    }

    async fn spawn_with(config: OrchestratorConfig) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let services = Arc::new(app::services::build_services(config, Arc::new(SystemClock)));
        let router = app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: Value) -> Value {
    let res = client.post(srv.url("/v1/jobs")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json::<Value>().await.unwrap()["job"].clone()
}

#[tokio::test]
async fn health_check_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/healthz")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn submit_then_replay_with_idempotency_header() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let body = json!({ "tenant_id": "acme", "model": "gpt-4o", "payload": { "prompt": "hi" } });

    let res = client
        .post(srv.url("/v1/jobs"))
        .header("Idempotency-Key", "req-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let first: Value = res.json().await.unwrap();
    assert_eq!(first["idempotent_replay"], false);
    assert_eq!(first["job"]["status"], "queued");
    assert_eq!(first["job"]["priority"], 3);
    assert_eq!(first["job"]["max_attempts"], 3);
    assert_eq!(first["job"]["idempotency_key"], "req-1");

    let res = client
        .post(srv.url("/v1/jobs"))
        .header("Idempotency-Key", "req-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let second: Value = res.json().await.unwrap();
    assert_eq!(second["idempotent_replay"], true);
    assert_eq!(second["job"]["id"], first["job"]["id"]);
}

#[tokio::test]
async fn invalid_submissions_are_rejected_with_validation_error() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for body in [
        json!({ "tenant_id": "acme", "model": "m", "priority": 11 }),
        json!({ "tenant_id": "acme", "model": "" }),
        json!({ "tenant_id": "", "model": "m" }),
        json!({ "tenant_id": "acme", "model": "m", "payload": [1, 2, 3] }),
        json!({ "tenant_id": "acme", "model": "m", "max_attempts": 26 }),
    ] {
        let res = client.post(srv.url("/v1/jobs")).json(&body).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let err: Value = res.json().await.unwrap();
        assert_eq!(err["error"], "validation_error");
    }

    let res = client
        .post(srv.url("/v1/jobs"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn worker_lifecycle_lease_heartbeat_complete() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let job = submit(&client, &srv, json!({ "tenant_id": "acme", "model": "gpt-4o" })).await;
    let job_id = job["id"].as_str().unwrap().to_string();

    let res = client.post(srv.url("/v1/workers/w-1/lease")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let leased: Value = res.json().await.unwrap();
    assert_eq!(leased["job"]["id"], job_id.as_str());
    assert_eq!(leased["job"]["status"], "running");
    assert_eq!(leased["job"]["worker_id"], "w-1");
    assert_eq!(leased["job"]["attempt"], 1);

    let res = client
        .post(srv.url("/v1/workers/w-1/heartbeat"))
        .json(&json!({ "active_job_ids": [job_id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let ack: Value = res.json().await.unwrap();
    assert_eq!(ack["revoked_job_ids"], json!([]));
    assert_eq!(ack["worker"]["active_slots"], 1);

    let res = client
        .post(srv.url("/v1/workers/w-1/complete"))
        .json(&json!({ "job_id": job_id, "outcome": "succeeded", "tokens": 321, "cost_usd": 0.02 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let done: Value = res.json().await.unwrap();
    assert_eq!(done["job"]["status"], "succeeded");

    let res = client.get(srv.url(&format!("/v1/jobs/{job_id}"))).send().await.unwrap();
    let snapshot: Value = res.json().await.unwrap();
    assert_eq!(snapshot["latest_attempt"]["tokens"], 321);
    assert_eq!(snapshot["latest_attempt"]["outcome"], "succeeded");

    // Nothing left to do.
    let res = client.post(srv.url("/v1/workers/w-1/lease")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    // A second completion is refused.
    let res = client
        .post(srv.url("/v1/workers/w-1/complete"))
        .json(&json!({ "job_id": job_id, "outcome": "succeeded" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn failure_with_single_attempt_dead_letters_then_admin_replays() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let job = submit(&client, &srv, json!({ "tenant_id": "acme", "model": "m", "max_attempts": 1 })).await;
    let job_id = job["id"].as_str().unwrap().to_string();

    client.post(srv.url("/v1/workers/w-1/lease")).send().await.unwrap();
    let res = client
        .post(srv.url("/v1/workers/w-1/complete"))
        .json(&json!({
            "job_id": job_id,
            "outcome": "failed",
            "error_code": "UPSTREAM_500",
            "error_message": "provider exploded",
        }))
        .send()
        .await
        .unwrap();
    let failed: Value = res.json().await.unwrap();
    assert_eq!(failed["job"]["status"], "dlq");
    assert_eq!(failed["job"]["error_code"], "UPSTREAM_500");

    let res = client
        .get(srv.url("/v1/jobs?status=dlq&tenant=acme"))
        .send()
        .await
        .unwrap();
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);

    let res = client
        .post(srv.url(&format!("/v1/admin/jobs/{job_id}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let replayed: Value = res.json().await.unwrap();
    assert_eq!(replayed["job"]["status"], "queued");
    assert_eq!(replayed["job"]["attempt"], 0);

    let res = client.get(srv.url("/v1/metrics/summary")).send().await.unwrap();
    let metrics: Value = res.json().await.unwrap();
    assert_eq!(metrics["dlq_size"], 0);
    assert_eq!(metrics["queued"], 1);
    assert_eq!(metrics["retry_rate"], 0.0);
    assert!(metrics["p95_latency_ms"].is_u64());
}

#[tokio::test]
async fn cancel_twice_reports_invalid_state() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let job = submit(&client, &srv, json!({ "tenant_id": "acme", "model": "m" })).await;
    let url = srv.url(&format!("/v1/jobs/{}/cancel", job["id"].as_str().unwrap()));

    let res = client.post(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["job"]["status"], "cancelled");
    assert!(body["job"]["finished_at"].is_string());

    let res = client.post(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["error"], "invalid_state");

    let res = client.post(srv.url("/v1/workers/w-1/lease")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url("/v1/jobs/0190a0a0-0000-7000-8000-000000000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["error"], "not_found");

    let res = client.get(srv.url("/v1/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(srv.url("/v1/jobs?limit=0")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submission_rate_limit_answers_429() {
    let srv = TestServer::spawn_with(OrchestratorConfig {
        tenant_defaults: TenantDefaults {
            concurrency: 4,
            rps: 1,
            token_budget_per_min: 1_000,
        },
        ..OrchestratorConfig::default()
    })
    .await;
    let client = reqwest::Client::new();
    submit(&client, &srv, json!({ "tenant_id": "acme", "model": "m" })).await;

    let res = client
        .post(srv.url("/v1/jobs"))
        .json(&json!({ "tenant_id": "acme", "model": "m" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(res.headers().get("retry-after").is_some());
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["error"], "rate_limited");
    assert_eq!(err["reason"], "rate_limited");
}

#[tokio::test]
async fn tenant_limits_can_be_read_and_updated() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .put(srv.url("/v1/tenants/acme/limit"))
        .json(&json!({ "concurrency": 2, "rps": 5, "token_budget_per_min": 9000 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(srv.url("/v1/tenants/acme/limit")).send().await.unwrap();
    let usage: Value = res.json().await.unwrap();
    assert_eq!(usage["limit"]["concurrency"], 2);
    assert_eq!(usage["limit"]["token_budget_per_min"], 9000);
    assert_eq!(usage["running"], 0);

    let res = client
        .put(srv.url("/v1/tenants/acme/limit"))
        .json(&json!({ "concurrency": 0, "rps": 5, "token_budget_per_min": 9000 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(srv.url("/v1/tenants/limits")).send().await.unwrap();
    let all: Value = res.json().await.unwrap();
    assert!(
        all["limits"]
            .as_array()
            .unwrap()
            .iter()
            .any(|l| l["tenant_id"] == "acme")
    );
}

#[tokio::test]
async fn paused_queue_leases_nothing_until_resumed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    submit(&client, &srv, json!({ "tenant_id": "acme", "model": "m" })).await;

    let res = client.post(srv.url("/v1/admin/queue/pause")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.post(srv.url("/v1/workers/w-1/lease")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let metrics: Value = client
        .get(srv.url("/v1/metrics/summary"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["paused"], true);

    client.post(srv.url("/v1/admin/queue/resume")).send().await.unwrap();
    let res = client.post(srv.url("/v1/workers/w-1/lease")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn events_can_be_polled_with_a_cursor() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let job = submit(&client, &srv, json!({ "tenant_id": "acme", "model": "m" })).await;

    let res = client.get(srv.url("/v1/events?after=0")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page: Value = res.json().await.unwrap();
    let events = page["events"].as_array().unwrap();
    assert_eq!(events[0]["type"], "job.created");
    assert_eq!(events[0]["job_id"], job["id"]);

    let cursor = page["last_seq"].as_u64().unwrap();
    client.post(srv.url("/v1/workers/w-1/lease")).send().await.unwrap();

    let res = client
        .get(srv.url(&format!("/v1/events?after={cursor}")))
        .send()
        .await
        .unwrap();
    let page: Value = res.json().await.unwrap();
    let types: Vec<&str> = page["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["type"].as_str())
        .collect();
    assert!(types.contains(&"job.started"));
    assert!(!types.contains(&"job.created"));
}
