//! Shared fixtures: a scripted fake node, a recording artifact sink and an
//! engine wired to the in-memory job store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use forgefleet_api::config::ServerConfig;
use forgefleet_api::engine::{ArtifactError, ArtifactSink, Engine, EngineConfig};
use forgefleet_api::router::build_app_router;
use forgefleet_api::state::AppState;
use forgefleet_api::ws::WsManager;
use forgefleet_core::types::DbId;
use forgefleet_db::models::job::{Job, NewJob};
use forgefleet_db::models::status::JobStatus;
use forgefleet_db::store::{JobStore, MemoryJobStore};
use forgefleet_events::StatusBroadcaster;
use forgefleet_node::catalog::NodeModelCatalog;
use forgefleet_node::client::{EventStream, ModelEntry, NodeClient, NodeError, QueueJoinAck};
use forgefleet_node::normalize::ArtifactRef;
use forgefleet_node::payload::QueueJoinRequest;
use forgefleet_node::registry::NodeRegistry;

// ---------------------------------------------------------------------------
// Fake node
// ---------------------------------------------------------------------------

/// One scripted event-stream item.
#[derive(Debug, Clone)]
pub enum Frame {
    Data(String),
    Error(String),
}

pub fn data(value: Value) -> Frame {
    Frame::Data(value.to_string())
}

/// Event stream script for one submission.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub frames: Vec<Frame>,
    /// Keep the stream open after the frames instead of ending it.
    pub hold_open: bool,
}

impl Script {
    pub fn ending(frames: Vec<Frame>) -> Self {
        Self { frames, hold_open: false }
    }

    pub fn held(frames: Vec<Frame>) -> Self {
        Self { frames, hold_open: true }
    }
}

/// In-process [`NodeClient`] with scripted streams and recorded calls.
///
/// Streams are handed out in script order; once the scripts run out a
/// stream stays open and silent.
pub struct FakeNode {
    id: String,
    models: Vec<ModelEntry>,
    files: HashMap<String, Vec<u8>>,
    scripts: Mutex<VecDeque<Script>>,
    poll_body: Mutex<Value>,
    pub submissions: Mutex<Vec<QueueJoinRequest>>,
    pub interrupts: AtomicUsize,
    pub polls: AtomicUsize,
    fail_submit: bool,
    model_lookup_delay: Duration,
    submit_delay: Duration,
}

impl FakeNode {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            models: Vec::new(),
            files: HashMap::new(),
            scripts: Mutex::new(VecDeque::new()),
            poll_body: Mutex::new(json!({"active": false, "queued": false, "completed": false})),
            submissions: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            fail_submit: false,
            model_lookup_delay: Duration::ZERO,
            submit_delay: Duration::ZERO,
        }
    }

    pub fn with_models(mut self, titles: &[&str]) -> Self {
        self.models = titles
            .iter()
            .map(|title| ModelEntry {
                title: title.to_string(),
                model_name: title.split(' ').next().unwrap_or(title).to_string(),
                filename: None,
                hash: None,
            })
            .collect();
        self
    }

    pub fn with_file(mut self, path: &str, bytes: &[u8]) -> Self {
        self.files.insert(path.to_string(), bytes.to_vec());
        self
    }

    pub fn with_script(self, script: Script) -> Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn failing_submit(mut self) -> Self {
        self.fail_submit = true;
        self
    }

    /// Slow down checkpoint listing, widening the window between claim
    /// and submission.
    pub fn with_model_lookup_delay(mut self, delay: Duration) -> Self {
        self.model_lookup_delay = delay;
        self
    }

    /// Delay before a submission is accepted.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn set_poll_body(&self, body: Value) {
        *self.poll_body.lock().unwrap() = body;
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn base_url(&self) -> &str {
        "http://fake-node:7860"
    }

    fn fn_index(&self) -> u32 {
        257
    }

    async fn list_models(&self) -> Result<Vec<ModelEntry>, NodeError> {
        tokio::time::sleep(self.model_lookup_delay).await;
        Ok(self.models.clone())
    }

    async fn submit(&self, request: &QueueJoinRequest) -> Result<QueueJoinAck, NodeError> {
        tokio::time::sleep(self.submit_delay).await;
        if self.fail_submit {
            return Err(NodeError::Api {
                status: 503,
                body: "queue full".into(),
            });
        }
        self.submissions.lock().unwrap().push(request.clone());
        Ok(QueueJoinAck {
            event_id: Some("evt-1".into()),
        })
    }

    async fn open_stream(&self, _session_hash: &str) -> Result<EventStream, NodeError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::held(Vec::new()));

        let frames = futures::stream::iter(script.frames.into_iter().map(|frame| match frame {
            Frame::Data(text) => Ok(text),
            Frame::Error(message) => Err(NodeError::Stream(message)),
        }));
        if script.hold_open {
            Ok(frames.chain(futures::stream::pending()).boxed())
        } else {
            Ok(frames.boxed())
        }
    }

    async fn poll_progress(&self, _task_token: &str) -> Result<Value, NodeError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.poll_body.lock().unwrap().clone())
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, NodeError> {
        self.files.get(path).cloned().ok_or(NodeError::Api {
            status: 404,
            body: format!("no such file: {path}"),
        })
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, NodeError> {
        Err(NodeError::Api {
            status: 404,
            body: format!("no such url: {url}"),
        })
    }

    async fn interrupt(&self) -> Result<(), NodeError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

/// [`ArtifactSink`] that records what it was asked to save.
#[derive(Default)]
pub struct RecordingSink {
    pub saved: Mutex<Vec<(DbId, usize, ArtifactRef)>>,
    pub previews: AtomicUsize,
    /// Number of upcoming result saves that fail.
    pub failures: AtomicUsize,
}

impl RecordingSink {
    pub fn saved_count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }
}

#[async_trait]
impl ArtifactSink for RecordingSink {
    async fn save_result(
        &self,
        job_id: DbId,
        index: usize,
        artifact: &ArtifactRef,
        _node: &dyn NodeClient,
    ) -> Result<String, ArtifactError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ArtifactError::Empty);
        }
        self.saved
            .lock()
            .unwrap()
            .push((job_id, index, artifact.clone()));
        Ok(format!("{job_id}/{index:02}.png"))
    }

    async fn save_preview(&self, job_id: DbId, _data: &str) -> Result<String, ArtifactError> {
        self.previews.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{job_id}/preview.png"))
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// Engine settings that keep tests deterministic: no background polling,
/// no liveness ticks, no assumed completion unless a test opts in.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        output_dir: std::env::temp_dir().join("forgefleet-tests"),
        dispatch_interval: Duration::from_secs(3600),
        pending_window: None,
        poll_interval: Duration::from_secs(3600),
        max_poll_attempts: 0,
        stall_window: Duration::from_secs(3600),
        max_empty_completions: 3,
        assume_complete_after: Some(Duration::from_secs(45)),
    }
}

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub engine: Arc<Engine>,
}

impl Harness {
    pub fn new(nodes: Vec<Arc<FakeNode>>, sink: Arc<dyn ArtifactSink>, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let broadcaster = Arc::new(StatusBroadcaster::default());
        let registry = NodeRegistry::new(nodes.into_iter().map(|n| n as Arc<dyn NodeClient>));
        let engine = Engine::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            registry,
            Arc::new(NodeModelCatalog),
            sink,
            Arc::clone(&broadcaster),
            config,
        );
        Self {
            store,
            broadcaster,
            engine,
        }
    }

    pub async fn submit(&self, node: &str, params: Value) -> Job {
        self.store
            .create(&NewJob {
                target_node: node.to_string(),
                generation_params: params,
                retry_count: 0,
                retry_of_job_id: None,
            })
            .await
            .unwrap()
    }

    pub async fn job(&self, id: DbId) -> Job {
        self.store.find_by_id(id).await.unwrap().expect("job exists")
    }

    /// Wait until `id` reaches `status`, panicking after a few seconds.
    pub async fn wait_for_status(&self, id: DbId, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = self.job(id).await;
            if job.status() == Some(status) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status}");
    }

    /// Wait until the monitor for `id` has gone away.
    pub async fn wait_for_monitor_exit(&self, id: DbId) {
        for _ in 0..500 {
            if !self.engine.active_monitors().contains(&id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("monitor for job {id} never exited");
    }
}

// ---------------------------------------------------------------------------
// Node event bodies
// ---------------------------------------------------------------------------

pub fn progress_frame(step: u32, total: u32) -> Frame {
    data(json!({
        "msg": "progress",
        "event_id": "evt-1",
        "progress_data": [{"index": step, "length": total, "unit": "steps", "desc": null}]
    }))
}

pub fn completed_frame(paths: &[&str]) -> Frame {
    data(completed_body(paths))
}

pub fn completed_body(paths: &[&str]) -> Value {
    let gallery: Vec<Value> = paths
        .iter()
        .map(|p| json!({"image": {"path": p, "url": null}, "caption": null}))
        .collect();
    json!({
        "msg": "process_completed",
        "event_id": "evt-1",
        "success": true,
        "output": {"data": [gallery, "{}", "<p></p>"]}
    })
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

pub fn test_config() -> ServerConfig {
    ServerConfig::from_lookup(|_| None).expect("defaults are valid")
}

/// Build the application router over a harness, with the same middleware
/// stack as production.
pub fn build_test_app(harness: &Harness) -> Router {
    let config = test_config();
    let state = AppState {
        store: Arc::clone(&harness.store) as Arc<dyn JobStore>,
        config: Arc::new(config.clone()),
        ws_manager: Arc::new(WsManager::new()),
        engine: Arc::clone(&harness.engine),
        broadcaster: Arc::clone(&harness.broadcaster),
    };
    build_app_router(state, &config)
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::get(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response.into_body()).await)
}

pub async fn body_json(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    }
}
