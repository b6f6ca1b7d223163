//! HTTP surface tests through the full middleware stack.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use common::*;

fn harness() -> Harness {
    let node = FakeNode::new("gpu-a").with_models(&["sd_xl_base_1.0.safetensors [31e35c80fc]"]);
    Harness::new(
        vec![Arc::new(node), Arc::new(FakeNode::new("gpu-b"))],
        Arc::new(RecordingSink::default()),
        test_engine_config(),
    )
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_ok_with_reachable_store() {
    let h = harness();
    let app = build_test_app(&h);

    let (status, body) = get(&app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db_healthy"], true);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn responses_pass_through_request_id_and_cors_layers() {
    let h = harness();
    let app = build_test_app(&h);

    let request = Request::get("/health")
        .header("origin", "http://localhost:5173")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-42");
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost:5173"
    );
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_creates_pending_job() {
    let h = harness();
    let app = build_test_app(&h);

    let (status, body) = post_json(
        &app,
        "/api/v1/jobs",
        json!({"target_node": "gpu-a", "generation_params": {"prompt": "a red fox"}}),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["target_node"], "gpu-a");
    assert_eq!(body["data"]["status_id"], 1);
    assert_eq!(body["data"]["progress_percent"], 0);
    assert_eq!(body["data"]["generation_params"]["prompt"], "a red fox");
}

#[tokio::test]
async fn submit_rejects_unknown_node() {
    let h = harness();
    let app = build_test_app(&h);

    let (status, body) = post_json(&app, "/api/v1/jobs", json!({"target_node": "gpu-z"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn submit_rejects_non_object_params() {
    let h = harness();
    let app = build_test_app(&h);

    let (status, body) = post_json(
        &app,
        "/api/v1/jobs",
        json!({"target_node": "gpu-a", "generation_params": ["not", "an", "object"]}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_is_newest_first_and_filters_by_status() {
    let h = harness();
    let app = build_test_app(&h);
    let first = h.submit("gpu-a", json!({})).await;
    let second = h.submit("gpu-b", json!({})).await;
    h.engine.cancel_job(first.id).await.unwrap();

    let (status, body) = get(&app, "/api/v1/jobs").await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![second.id, first.id]);

    let (_, body) = get(&app, "/api/v1/jobs?status=cancelled").await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["id"], first.id);

    let (_, body) = get(&app, "/api/v1/jobs?target_node=gpu-b&limit=1").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn get_unknown_job_is_404() {
    let h = harness();
    let app = build_test_app(&h);

    let (status, body) = get(&app, "/api/v1/jobs/404").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Cancel / retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_then_cancel_again_conflicts() {
    let h = harness();
    let app = build_test_app(&h);
    let job = h.submit("gpu-a", json!({})).await;
    let uri = format!("/api/v1/jobs/{}/cancel", job.id);

    let (status, body) = post_json(&app, &uri, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status_id"], 5);

    let (status, body) = post_json(&app, &uri, json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, _) = post_json(&app, "/api/v1/jobs/999/cancel", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_only_accepts_failed_or_cancelled_jobs() {
    let h = harness();
    let app = build_test_app(&h);
    let job = h.submit("gpu-a", json!({"prompt": "again"})).await;
    let uri = format!("/api/v1/jobs/{}/retry", job.id);

    let (status, _) = post_json(&app, &uri, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.engine.cancel_job(job.id).await.unwrap();
    let (status, body) = post_json(&app, &uri, json!({})).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["retry_of_job_id"], job.id);
    assert_eq!(body["data"]["retry_count"], 1);
    assert_eq!(body["data"]["status_id"], 1);
    assert_eq!(body["data"]["generation_params"]["prompt"], "again");
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nodes_list_reports_leases() {
    let h = harness();
    let app = build_test_app(&h);
    let job = h.submit("gpu-b", json!({})).await;
    h.engine.dispatch_cycle().await.unwrap();

    let (status, body) = get(&app, "/api/v1/nodes").await;

    assert_eq!(status, StatusCode::OK);
    let nodes = body["data"].as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["id"], "gpu-a");
    assert_eq!(nodes[0]["busy"], false);
    assert_eq!(nodes[1]["id"], "gpu-b");
    assert_eq!(nodes[1]["busy"], true);
    assert_eq!(nodes[1]["current_job_id"], job.id);
}

#[tokio::test]
async fn node_models_are_proxied() {
    let h = harness();
    let app = build_test_app(&h);

    let (status, body) = get(&app, "/api/v1/nodes/gpu-a/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"][0]["title"],
        "sd_xl_base_1.0.safetensors [31e35c80fc]"
    );

    let (status, _) = get(&app, "/api/v1/nodes/gpu-z/models").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
