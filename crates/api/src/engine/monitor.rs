//! Per-job monitor.
//!
//! One [`MonitorSession`] follows one processing job through the node's
//! event stream: `attached -> observing -> finalizing -> closed`. The
//! stream task owns every terminal transition. A companion poll task,
//! keyed by the task token, only contributes progress and previews; the
//! two coordinate through the job store alone.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use forgefleet_core::hashing::{sha256_hex, set_fingerprint};
use forgefleet_core::progress::{
    clamp_display_percent, is_informative, liveness_increment, LIVENESS_CAP, MAX_PERCENT,
    MIN_DISPLAY_PERCENT,
};
use forgefleet_core::types::{DbId, Timestamp};
use forgefleet_db::models::job::Job;
use forgefleet_node::client::NodeClient;
use forgefleet_node::messages::{parse_event, EventKind, NodeEvent};
use forgefleet_node::normalize::{
    extract_artifacts, extract_preview, extract_progress, task_state, ArtifactRef,
};

use super::artifacts::ArtifactError;
use super::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    /// Submitted; event stream not yet confirmed.
    Attached,
    /// Receiving events.
    Observing,
    /// Persisting artifacts for a completion.
    Finalizing,
    /// Terminal. Further input is discarded.
    Closed,
}

/// Whether the stream loop keeps reading after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

// ---------------------------------------------------------------------------
// Progress tracking
// ---------------------------------------------------------------------------

/// Last stored and published progress for one task.
///
/// The stream task and the poll task each own one.
struct ProgressTracker {
    job_id: DbId,
    stored: i16,
    published: i16,
    last_real: Instant,
    last_preview: Option<String>,
}

impl ProgressTracker {
    fn new(job_id: DbId, stored: i16) -> Self {
        Self {
            job_id,
            stored,
            published: stored,
            last_real: Instant::now(),
            last_preview: None,
        }
    }

    async fn apply(&mut self, engine: &Engine, body: &Value) {
        if let Some(raw) = extract_progress(body) {
            // 100% is reserved for the completion commit.
            let percent = clamp_display_percent(raw).min(MAX_PERCENT - 1);
            if is_informative(self.stored, percent) {
                self.stored = percent;
                self.published = percent;
                self.last_real = Instant::now();
                if let Err(e) = engine.store.update_progress(self.job_id, percent, None).await {
                    tracing::warn!(job_id = self.job_id, error = %e, "Failed to store progress");
                }
                engine.broadcaster.publish_progress(self.job_id, percent, None);
            }
        }

        if let Some(data) = extract_preview(body) {
            self.apply_preview(engine, &data).await;
        }
    }

    async fn apply_preview(&mut self, engine: &Engine, data: &str) {
        let digest = sha256_hex(data.as_bytes());
        if self.last_preview.as_deref() == Some(digest.as_str()) {
            return;
        }
        match engine.sink.save_preview(self.job_id, data).await {
            Ok(path) => {
                self.last_preview = Some(digest);
                if let Err(e) = engine
                    .store
                    .update_progress(self.job_id, self.stored, Some(&path))
                    .await
                {
                    tracing::warn!(job_id = self.job_id, error = %e, "Failed to store preview");
                }
                engine.broadcaster.publish_progress(
                    self.job_id,
                    self.published.max(MIN_DISPLAY_PERCENT),
                    Some(path),
                );
            }
            Err(e) => {
                tracing::debug!(job_id = self.job_id, error = %e, "Discarding unreadable preview");
            }
        }
    }

    /// Publish a small synthetic step once real progress has stalled.
    fn liveness_tick(&mut self, engine: &Engine, window: Duration) {
        if self.last_real.elapsed() < window {
            return;
        }
        if let Some(next) = liveness_increment(self.published, 1, LIVENESS_CAP) {
            self.published = next;
            engine.broadcaster.publish_progress(self.job_id, next, None);
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct MonitorSession {
    engine: Arc<Engine>,
    node: Arc<dyn NodeClient>,
    job_id: DbId,
    target_node: String,
    session_hash: String,
    task_token: String,
    dispatched_at: Timestamp,
    phase: MonitorPhase,
    generation_started: bool,
    progress: ProgressTracker,
    /// Artifact-set fingerprints of completions already acted on.
    fingerprints: HashSet<String>,
    empty_completions: u32,
    /// Completion whose artifacts could not be persisted yet.
    pending_completion: Option<NodeEvent>,
}

impl MonitorSession {
    /// Build a session for a processing job. `None` if the job was never
    /// given correlation ids.
    pub fn attach(engine: Arc<Engine>, job: &Job, node: Arc<dyn NodeClient>) -> Option<Self> {
        let session_hash = job.session_hash.clone()?;
        let task_token = job.task_token.clone()?;
        Some(Self {
            engine,
            node,
            job_id: job.id,
            target_node: job.target_node.clone(),
            session_hash,
            task_token,
            dispatched_at: job.dispatched_at.unwrap_or(job.created_at),
            phase: MonitorPhase::Attached,
            generation_started: false,
            progress: ProgressTracker::new(job.id, job.progress_percent),
            fingerprints: HashSet::new(),
            empty_completions: 0,
            pending_completion: None,
        })
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn job_id(&self) -> DbId {
        self.job_id
    }

    /// Drive the session until a terminal transition, cancellation or shutdown.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let opened = tokio::select! {
            _ = cancel.cancelled() => None,
            opened = self.node.open_stream(&self.session_hash) => Some(opened),
        };
        let mut stream = match opened {
            None => return self.stop(),
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                let message = format!(
                    "Transport error: could not open event stream on node '{}': {e}",
                    self.target_node
                );
                self.fail(&message).await;
                return self.stop();
            }
        };
        self.phase = MonitorPhase::Observing;
        tracing::debug!(job_id = self.job_id, session_hash = %self.session_hash, "Monitor observing");

        let poll_stop = cancel.child_token();
        self.engine.tasks.spawn(poll_progress_loop(
            Arc::clone(&self.engine),
            Arc::clone(&self.node),
            self.job_id,
            self.task_token.clone(),
            self.progress.stored,
            poll_stop.clone(),
        ));

        let window = self.engine.config.stall_window;
        let mut stall = tokio::time::interval_at(Instant::now() + window, window);
        stall.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                _ = cancel.cancelled() => Flow::Stop,
                _ = stall.tick() => {
                    self.on_stall_tick();
                    Flow::Continue
                }
                item = stream.next() => match item {
                    Some(Ok(text)) => match parse_event(&text) {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::trace!(job_id = self.job_id, "Ignoring unrecognised event payload");
                            Flow::Continue
                        }
                    },
                    Some(Err(e)) => {
                        self.handle_stream_end(Some(e.to_string())).await;
                        Flow::Stop
                    }
                    None => {
                        self.handle_stream_end(None).await;
                        Flow::Stop
                    }
                },
            };
            if flow == Flow::Stop {
                break;
            }
        }

        poll_stop.cancel();
        self.stop();
    }

    /// Tear down after the loop. On shutdown the job is left as-is for
    /// recovery; otherwise the lease and monitor entry are released.
    fn stop(&mut self) {
        if self.engine.shutdown.is_cancelled() && self.phase != MonitorPhase::Closed {
            tracing::info!(job_id = self.job_id, "Monitor detached for shutdown");
            return;
        }
        self.close();
    }

    /// Release the node and drop the monitor registration.
    pub fn close(&mut self) {
        self.phase = MonitorPhase::Closed;
        self.engine.finish_monitor(self.job_id, &self.target_node);
    }

    fn mark_started(&mut self) {
        self.generation_started = true;
        if self.phase == MonitorPhase::Attached {
            self.phase = MonitorPhase::Observing;
        }
    }

    fn on_stall_tick(&mut self) {
        if self.generation_started && self.phase == MonitorPhase::Observing {
            let window = self.engine.config.stall_window;
            self.progress.liveness_tick(&self.engine, window);
        }
    }

    /// Apply one normalized node event.
    pub async fn handle_event(&mut self, event: NodeEvent) -> Flow {
        if self.phase == MonitorPhase::Closed {
            return Flow::Stop;
        }

        match event.kind.clone() {
            EventKind::Queued | EventKind::Heartbeat | EventKind::Closed => Flow::Continue,
            EventKind::Unknown(name) => {
                tracing::trace!(job_id = self.job_id, kind = %name, "Ignoring unknown event");
                Flow::Continue
            }
            EventKind::Started => {
                self.mark_started();
                Flow::Continue
            }
            EventKind::Progress | EventKind::Generating => {
                self.mark_started();
                self.progress.apply(&self.engine, &event.body).await;
                Flow::Continue
            }
            EventKind::Completed => self.handle_completion(event).await,
            EventKind::Failed => {
                let reason = event
                    .error_message()
                    .unwrap_or_else(|| "node reported a failure".to_string());
                self.fail(&format!("Node error: {reason}")).await;
                Flow::Stop
            }
        }
    }

    async fn handle_completion(&mut self, event: NodeEvent) -> Flow {
        let artifacts = extract_artifacts(&event.body);
        let fingerprint = (!artifacts.is_empty())
            .then(|| set_fingerprint(artifacts.iter().map(ArtifactRef::identity)));

        if let Some(fp) = &fingerprint {
            if self.fingerprints.contains(fp) {
                tracing::debug!(job_id = self.job_id, "Duplicate completion discarded");
                return Flow::Continue;
            }
        }

        if self.store_says_terminal().await {
            tracing::debug!(job_id = self.job_id, "Job already terminal, completion discarded");
            self.phase = MonitorPhase::Closed;
            return Flow::Stop;
        }

        let Some(fingerprint) = fingerprint else {
            self.empty_completions += 1;
            if self.empty_completions >= self.engine.config.max_empty_completions {
                let message = format!(
                    "Data error: node reported completion without artifacts {} times",
                    self.empty_completions
                );
                self.fail(&message).await;
                return Flow::Stop;
            }
            tracing::warn!(
                job_id = self.job_id,
                count = self.empty_completions,
                "Completion carried no artifacts",
            );
            return Flow::Continue;
        };

        self.fingerprints.insert(fingerprint.clone());
        self.phase = MonitorPhase::Finalizing;

        match self.save_artifacts(&artifacts).await {
            Ok(paths) => {
                self.commit_completion(&paths, None).await;
                Flow::Stop
            }
            Err(e) => {
                tracing::warn!(
                    job_id = self.job_id,
                    error = %e,
                    "Failed to persist artifacts, holding completion",
                );
                self.fingerprints.remove(&fingerprint);
                self.pending_completion = Some(event);
                self.phase = MonitorPhase::Observing;
                Flow::Continue
            }
        }
    }

    /// The stream ended (`error` is `None`) or broke.
    pub async fn handle_stream_end(&mut self, error: Option<String>) {
        if self.phase == MonitorPhase::Closed {
            return;
        }
        if self.store_says_terminal().await {
            self.phase = MonitorPhase::Closed;
            return;
        }

        if let Some(event) = self.pending_completion.take() {
            tracing::info!(job_id = self.job_id, "Retrying held completion after stream fault");
            if self.handle_completion(event).await == Flow::Stop {
                return;
            }
        }

        let reason = error.unwrap_or_else(|| "event stream closed before completion".to_string());

        if let Some(grace) = self.engine.config.assume_complete_after {
            let elapsed = (Utc::now() - self.dispatched_at)
                .to_std()
                .unwrap_or_default();
            if elapsed >= grace {
                if self.node_reports_running().await {
                    let message =
                        format!("Transport error: {reason} (node still reports the task as active)");
                    self.fail(&message).await;
                } else {
                    let note = format!(
                        "assumed complete: event stream ended after {}s without a completion signal",
                        elapsed.as_secs()
                    );
                    self.commit_completion(&[], Some(&note)).await;
                }
                return;
            }
        }

        self.fail(&format!("Transport error: {reason}")).await;
    }

    async fn node_reports_running(&self) -> bool {
        match self.node.poll_progress(&self.task_token).await {
            Ok(body) => task_state(&body).is_running(),
            Err(e) => {
                tracing::warn!(
                    job_id = self.job_id,
                    error = %e,
                    "Verification poll failed, treating task as finished",
                );
                false
            }
        }
    }

    /// Terminal guard. A store error reads as "not terminal" so the
    /// conditional update decides.
    async fn store_says_terminal(&self) -> bool {
        match self.engine.store.find_by_id(self.job_id).await {
            Ok(Some(job)) => job.is_terminal(),
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(job_id = self.job_id, error = %e, "Terminal check failed");
                false
            }
        }
    }

    async fn save_artifacts(&self, artifacts: &[ArtifactRef]) -> Result<Vec<String>, ArtifactError> {
        let mut paths = Vec::with_capacity(artifacts.len());
        for (index, artifact) in artifacts.iter().enumerate() {
            let path = self
                .engine
                .sink
                .save_result(self.job_id, index, artifact, self.node.as_ref())
                .await?;
            paths.push(path);
        }
        Ok(paths)
    }

    async fn commit_completion(&mut self, paths: &[String], note: Option<&str>) {
        match self.engine.store.complete(self.job_id, paths, note).await {
            Ok(Some(job)) => {
                tracing::info!(
                    job_id = self.job_id,
                    node_id = %self.target_node,
                    artifacts = paths.len(),
                    assumed = note.is_some(),
                    "Job completed",
                );
                self.engine.broadcaster.publish_job_update(&job);
            }
            Ok(None) => {
                tracing::debug!(job_id = self.job_id, "Job left processing before completion was recorded");
            }
            Err(e) => {
                tracing::error!(job_id = self.job_id, error = %e, "Failed to record job completion");
            }
        }
        self.phase = MonitorPhase::Closed;
    }

    async fn fail(&mut self, message: &str) {
        match self.engine.store.fail(self.job_id, message).await {
            Ok(Some(job)) => {
                tracing::warn!(job_id = self.job_id, node_id = %self.target_node, error = message, "Job failed");
                self.engine.broadcaster.publish_job_update(&job);
            }
            Ok(None) => {
                tracing::debug!(job_id = self.job_id, "Job already terminal, failure not recorded");
            }
            Err(e) => {
                tracing::error!(job_id = self.job_id, error = %e, "Failed to record job failure");
            }
        }
        self.phase = MonitorPhase::Closed;
    }
}

// ---------------------------------------------------------------------------
// Poll fallback
// ---------------------------------------------------------------------------

async fn poll_progress_loop(
    engine: Arc<Engine>,
    node: Arc<dyn NodeClient>,
    job_id: DbId,
    task_token: String,
    stored: i16,
    stop: CancellationToken,
) {
    let mut tracker = ProgressTracker::new(job_id, stored);
    let interval = engine.config.poll_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for attempt in 1..=engine.config.max_poll_attempts {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match engine.store.find_by_id(job_id).await {
            Ok(Some(job)) if !job.is_terminal() => {}
            Ok(_) => return,
            Err(e) => {
                tracing::debug!(job_id, error = %e, "Poll skipped, store unavailable");
                continue;
            }
        }

        match node.poll_progress(&task_token).await {
            Ok(body) => {
                if stop.is_cancelled() {
                    return;
                }
                let state = task_state(&body);
                if state.completed {
                    tracing::debug!(job_id, attempt, "Node reports task completed, polling stopped");
                    return;
                }
                if state.active {
                    tracker.apply(&engine, &body).await;
                }
            }
            Err(e) => tracing::debug!(job_id, attempt, error = %e, "Progress poll failed"),
        }
    }

    tracing::debug!(job_id, "Progress poll attempts exhausted");
}
