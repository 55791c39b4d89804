mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::setup_db;
use queuectl::api::{self, ApiState};
use queuectl::jobs::{ActivityGauge, JobsRepo, NewJob};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(jobs: &JobsRepo) -> Router {
    api::router(ApiState {
        jobs: jobs.clone(),
        retries: None,
        activity: ActivityGauge::default(),
    })
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn enqueue_over_http_creates_pending_job() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());

    let (status, body) = send(
        app(&jobs),
        post_json("/jobs", json!({"id": "job1", "command": "sleep 2"})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "job1");
    assert_eq!(body["state"], "pending");
    assert_eq!(body["attempts"], 0);
    assert_eq!(body["max_retries"], 3);

    let (status, body) = send(app(&jobs), get("/jobs/job1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["command"], "sleep 2");
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());

    let (status, body) = send(app(&jobs), post_json("/jobs", json!({"id": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("command"));

    send(app(&jobs), post_json("/jobs", json!({"id": "dup", "command": "true"}))).await;
    let (status, _) = send(
        app(&jobs),
        post_json("/jobs", json!({"id": "dup", "command": "true"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(app(&jobs), get("/jobs/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(app(&jobs), get("/jobs?state=running")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_filters_by_state() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());

    jobs.enqueue(NewJob::command("true").with_id("a"))
        .await
        .unwrap();
    jobs.enqueue(NewJob::command("true").with_id("b"))
        .await
        .unwrap();
    jobs.claim("worker-a").await.unwrap().unwrap();

    let (status, body) = send(app(&jobs), get("/jobs?state=pending")).await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], "b");

    let (_, body) = send(app(&jobs), get("/jobs")).await;
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn dlq_retry_over_http() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());

    jobs.enqueue(NewJob::command("false").with_id("dead1").with_max_retries(1))
        .await
        .unwrap();
    jobs.claim("worker-a").await.unwrap().unwrap();
    jobs.fail("dead1", "worker-a", Some("boom")).await.unwrap();
    jobs.enqueue(NewJob::command("true").with_id("alive"))
        .await
        .unwrap();

    let (status, body) = send(app(&jobs), get("/dlq")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["last_error"], "boom");

    let (status, body) = send(app(&jobs), post_json("/dlq/dead1/retry", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["attempts"], 0);

    let (status, _) = send(app(&jobs), post_json("/dlq/alive/retry", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(app(&jobs), post_json("/dlq/ghost/retry", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_metrics_and_health() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());

    jobs.enqueue(NewJob::command("true")).await.unwrap();
    jobs.enqueue(NewJob::command("true")).await.unwrap();

    let (status, body) = send(app(&jobs), get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"]["pending"], 2);
    assert_eq!(body["total"], 2);
    assert_eq!(body["workers"], 0);
    assert_eq!(body["scheduled_retries"], 0);

    let (status, body) = send(app(&jobs), get("/metrics/prom")).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap().to_string();
    assert!(text.contains("queuectl_jobs{state=\"pending\"} 2"), "{text}");
    assert!(text.contains("queuectl_jobs{state=\"dead\"} 0"), "{text}");

    let (status, _) = send(app(&jobs), get("/retries")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(app(&jobs), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));
}
