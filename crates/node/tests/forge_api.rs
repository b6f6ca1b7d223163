//! `ForgeApi` against an in-process stand-in for a Forge node.

use std::time::Duration;

use axum::extract::Query;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use forgefleet_node::api::ForgeApi;
use forgefleet_node::client::{NodeClient, NodeConfig, NodeError};
use forgefleet_node::messages::{parse_event, EventKind};
use forgefleet_node::payload::{build_request, SubmissionIds};

// ---------------------------------------------------------------------------
// Stand-in node
// ---------------------------------------------------------------------------

/// `alice:pw`
const EXPECTED_AUTH: &str = "Basic YWxpY2U6cHc=";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(EXPECTED_AUTH)
}

async fn sd_models(headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "missing credentials").into_response();
    }
    Json(json!([
        {"title": "sdxl/base.safetensors [31e35c80fc]", "model_name": "base", "filename": "/m/sdxl/base.safetensors", "hash": "31e35c80fc"}
    ]))
    .into_response()
}

async fn queue_join(Json(body): Json<Value>) -> impl IntoResponse {
    if body["fn_index"] != 257 || !body["data"][0].as_str().unwrap_or("").starts_with("task(") {
        return (StatusCode::UNPROCESSABLE_ENTITY, "bad payload").into_response();
    }
    Json(json!({"event_id": "evt-1"})).into_response()
}

async fn queue_data(Query(q): Query<std::collections::HashMap<String, String>>) -> impl IntoResponse {
    let session = q.get("session_hash").cloned().unwrap_or_default();
    let body = format!(
        "data: {{\"msg\":\"estimation\",\"session\":\"{session}\"}}\n\n\
         data: {{\"msg\":\"progress\",\"progress_data\":[{{\"index\":5,\"length\":20}}]}}\n\n\
         : keepalive\n\n\
         data: {{\"msg\":\"process_completed\",\"success\":true,\"output\":{{\"data\":[[{{\"image\":{{\"path\":\"/o/1.png\"}}}}]]}}}}\n\n"
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn progress(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "active": true,
        "queued": false,
        "completed": false,
        "progress": 0.5,
        "echo": body["id_task"],
        "live_preview": null
    }))
}

async fn files(uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    match uri.path().strip_prefix("/file=") {
        Some(path) if authorized(&headers) => (StatusCode::OK, format!("bytes of {path}")).into_response(),
        Some(_) => StatusCode::UNAUTHORIZED.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_node() -> String {
    let app = Router::new()
        .route("/sdapi/v1/sd-models", get(sd_models))
        .route("/sdapi/v1/interrupt", post(|| async { StatusCode::OK }))
        .route("/queue/join", post(queue_join))
        .route("/queue/data", get(queue_data))
        .route("/internal/progress", post(progress))
        .fallback(files);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn client(with_credentials: bool) -> ForgeApi {
    let base = spawn_node().await;
    let url = if with_credentials {
        base.replace("http://", "http://alice:pw@")
    } else {
        base
    };
    let config = NodeConfig::parse(&format!("gpu-test={url}"), 257).unwrap();
    ForgeApi::new(config, Duration::from_secs(5)).unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lists_models_with_basic_auth() {
    let api = client(true).await;
    let models = api.list_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].model_name, "base");
    assert!(!api.base_url().contains("alice"));
}

#[tokio::test]
async fn missing_credentials_surface_as_api_error() {
    let api = client(false).await;
    let err = api.list_models().await.unwrap_err();
    assert!(matches!(err, NodeError::Api { status: 401, .. }), "got {err:?}");
}

#[tokio::test]
async fn submit_then_stream_events() {
    let api = client(true).await;
    let ids = SubmissionIds::generate();
    let request = build_request(api.fn_index(), &ids, &json!({"prompt": "x"}), None).unwrap();

    let ack = api.submit(&request).await.unwrap();
    assert_eq!(ack.event_id.as_deref(), Some("evt-1"));

    let stream = api.open_stream(&ids.session_hash).await.unwrap();
    let kinds: Vec<EventKind> = stream
        .filter_map(|item| async move { item.ok().and_then(|t| parse_event(&t)) })
        .map(|e| e.kind)
        .collect()
        .await;
    assert_eq!(
        kinds,
        vec![EventKind::Queued, EventKind::Progress, EventKind::Completed]
    );
}

#[tokio::test]
async fn poll_progress_sends_task_token() {
    let api = client(true).await;
    let body = api.poll_progress("tok123").await.unwrap();
    assert_eq!(body["echo"], "tok123");
    assert_eq!(body["progress"], 0.5);
}

#[tokio::test]
async fn fetches_node_files_and_interrupts() {
    let api = client(true).await;
    let bytes = api.fetch_file("/o/1.png").await.unwrap();
    assert_eq!(bytes, b"bytes of /o/1.png");
    api.interrupt().await.unwrap();
}
