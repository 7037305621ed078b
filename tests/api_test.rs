//! HTTP edge end-to-end: submit over the API, poll status, receive the
//! terminal callback over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, http::StatusCode, routing::post};
use porter::api;
use porter::dispatcher::HttpCallbackSink;
use porter::engine::{Engine, EngineConfig};
use porter::executor::{ExecutorRegistry, PhaseExecutor, PhaseOutcome};
use porter::model::{Job, Phase, RetryPolicy};
use porter::saga::NoopUndoer;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct AlwaysSucceeds;

#[async_trait]
impl PhaseExecutor for AlwaysSucceeds {
    async fn execute(&self, _job: &Job, phase: Phase) -> PhaseOutcome {
        PhaseOutcome::Success {
            data: if phase == Phase::Output {
                json!({"files_processed": 7})
            } else {
                serde_json::Value::Null
            },
            undo: None,
        }
    }
}

fn test_engine() -> Engine {
    let mut registry = ExecutorRegistry::empty();
    registry.register("code-migration", Arc::new(AlwaysSucceeds));
    Engine::new(
        EngineConfig {
            workers: 2,
            claim_block: Duration::from_millis(50),
            reaper_interval: Duration::from_millis(100),
            retry_policy: RetryPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(40),
                jitter: 0.0,
            },
            callback_retries: 3,
            callback_backoff: Duration::from_millis(20),
            ..EngineConfig::default()
        },
        registry,
        Arc::new(NoopUndoer),
        Arc::new(HttpCallbackSink::new(None)),
    )
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn submit_poll_and_callback_over_http() {
    let engine = test_engine();
    engine.start();
    let server = serve(api::router(engine.clone())).await;

    // Local endpoint standing in for the caller's callback receiver.
    let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let receiver = Router::new().route(
        "/hook",
        post(move |Json(body): Json<serde_json::Value>| {
            let tx = tx.clone();
            async move {
                tx.send(body).ok();
                StatusCode::NO_CONTENT
            }
        }),
    );
    let receiver_url = serve(receiver).await;

    let client = reqwest::Client::new();

    // 202 + status-poll location.
    let response = client
        .post(format!("{server}/jobs"))
        .json(&json!({
            "job_type": "code-migration",
            "idempotency_key": "repo=app,rules=v2",
            "payload": {"repo": "git://example/app"},
            "metadata": {"workflow_id": "wf-7"},
            "timeout_ms": 10_000,
            "max_retries": 2,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let location = response
        .headers()
        .get("location")
        .expect("Location header")
        .to_str()
        .unwrap()
        .to_string();
    let body: serde_json::Value = response.json().await.unwrap();
    let job_id = body["job_id"].as_str().expect("job_id").to_string();
    assert_eq!(location, format!("/jobs/{job_id}"));

    // Register the HTTP callback.
    let response = client
        .post(format!("{server}/jobs/{job_id}/callback"))
        .json(&json!({"target": format!("{receiver_url}/hook")}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    // The terminal notification arrives at the receiver.
    let notification = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("callback within budget")
        .unwrap();
    assert_eq!(notification["status"], "completed");
    assert_eq!(notification["result"]["files_processed"], 7);
    assert_eq!(notification["metadata"]["workflow_id"], "wf-7");
    assert_eq!(
        notification["phases_completed"],
        json!(["ingestion", "verification", "execution", "output"])
    );

    // Status poll agrees.
    let report: serde_json::Value = client
        .get(format!("{server}{location}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["phase"], "completed");
    assert_eq!(report["progress"], 1.0);

    // The per-job event feed is exposed.
    let events: Vec<serde_json::Value> = client
        .get(format!("{server}/jobs/{job_id}/events"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!events.is_empty());

    // Resubmission with the same key is a duplicate, not a new job.
    let response = client
        .post(format!("{server}/jobs"))
        .json(&json!({
            "job_type": "code-migration",
            "idempotency_key": "repo=app,rules=v2",
        }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["job_id"].as_str().unwrap(), job_id);

    engine.shutdown();
}

#[tokio::test]
async fn unknown_job_is_404_and_bad_submission_is_400() {
    let engine = test_engine();
    let server = serve(api::router(engine.clone())).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{server}/jobs/00000000-0000-4000-8000-000000000000"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = client
        .post(format!("{server}/jobs"))
        .json(&json!({"job_type": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("job_type"));
}
