//! Job execution engine.
//!
//! The [`Engine`] owns the node lease table, a single dispatcher task and
//! one monitor task per processing job. All job state lives in the
//! [`JobStore`]; the lease table is the only shared in-memory state.

pub mod artifacts;
mod dispatcher;
pub mod lease;
pub mod monitor;
mod recovery;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use forgefleet_core::types::DbId;
use forgefleet_db::models::job::Job;
use forgefleet_db::store::JobStore;
use forgefleet_events::StatusBroadcaster;
use forgefleet_node::catalog::ArtifactCatalog;
use forgefleet_node::client::NodeClient;
use forgefleet_node::registry::NodeRegistry;

pub use artifacts::{ArtifactError, ArtifactSink, FsArtifactStore};
pub use lease::NodeLeases;
pub use monitor::{Flow, MonitorPhase, MonitorSession};

/// Dispatcher and monitor tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for result images and previews.
    pub output_dir: PathBuf,
    pub dispatch_interval: Duration,
    /// Only pending jobs created within this window are dispatched.
    /// `None` dispatches regardless of age.
    pub pending_window: Option<Duration>,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// How long real progress may stall before liveness ticks are published.
    pub stall_window: Duration,
    /// Zero-artifact completions tolerated before the job fails.
    pub max_empty_completions: u32,
    /// Grace period after which a broken stream is treated as completion.
    /// `None` disables assumed completion.
    pub assume_complete_after: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            dispatch_interval: Duration::from_secs(3),
            pending_window: Some(Duration::from_secs(86_400)),
            poll_interval: Duration::from_millis(1500),
            max_poll_attempts: 800,
            stall_window: Duration::from_secs(20),
            max_empty_completions: 3,
            assume_complete_after: Some(Duration::from_secs(45)),
        }
    }
}

/// Stop signal for a job the engine drives, from claim until its monitor
/// closes. Whoever holds the entry owns the node lease.
struct Watch {
    token: CancellationToken,
    /// The node has accepted the submission.
    submitted: bool,
}

/// Matches pending jobs with free nodes and follows them to a terminal state.
///
/// Created once at startup and shared as `Arc<Engine>`.
pub struct Engine {
    store: Arc<dyn JobStore>,
    nodes: NodeRegistry,
    leases: NodeLeases,
    catalog: Arc<dyn ArtifactCatalog>,
    sink: Arc<dyn ArtifactSink>,
    broadcaster: Arc<StatusBroadcaster>,
    config: EngineConfig,
    /// Jobs being dispatched or monitored, keyed by job id.
    monitors: Mutex<HashMap<DbId, Watch>>,
    /// Master token, cancelled on shutdown. Monitor tokens are children.
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Engine {
    pub fn new(
        store: Arc<dyn JobStore>,
        nodes: NodeRegistry,
        catalog: Arc<dyn ArtifactCatalog>,
        sink: Arc<dyn ArtifactSink>,
        broadcaster: Arc<StatusBroadcaster>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let leases = NodeLeases::new(nodes.ids().map(str::to_string));
        Arc::new(Self {
            store,
            nodes,
            leases,
            catalog,
            sink,
            broadcaster,
            config,
            monitors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn leases(&self) -> &NodeLeases {
        &self.leases
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.broadcaster
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Job ids being dispatched or monitored, ascending.
    pub fn active_monitors(&self) -> Vec<DbId> {
        let mut ids: Vec<DbId> = self.monitors().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<DbId, Watch>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-attach monitors for jobs left processing, then start the dispatcher.
    pub async fn start(self: &Arc<Self>) {
        match self.recover().await {
            Ok(reattached) => tracing::info!(reattached, "Restart recovery finished"),
            Err(e) => tracing::error!(error = %e, "Restart recovery failed"),
        }

        let engine = Arc::clone(self);
        self.tasks.spawn(async move { engine.run_dispatcher().await });
    }

    /// Stop the dispatcher and every monitor without finalizing any job.
    ///
    /// Jobs left processing are picked up by recovery on the next start.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                "Engine tasks did not stop before the shutdown timeout",
            );
        }
    }

    /// Cancel a pending or processing job.
    ///
    /// Returns `None` when the job does not exist or is already terminal.
    /// A job the engine is driving is signalled to stop and its owner
    /// frees the node. A job already on its node also gets a best-effort
    /// interrupt.
    pub async fn cancel_job(&self, job_id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let Some(job) = self.store.cancel(job_id).await? else {
            return Ok(None);
        };
        tracing::info!(job_id, node_id = %job.target_node, "Job cancelled");
        self.broadcaster.publish_job_update(&job);

        let interrupt = match self.monitors().get(&job_id) {
            Some(watch) => {
                watch.token.cancel();
                watch.submitted
            }
            None => {
                self.leases.release(&job.target_node, job_id);
                false
            }
        };
        if interrupt {
            if let Some(node) = self.nodes.get(&job.target_node) {
                self.tasks.spawn(interrupt_node(node, job_id));
            }
        }
        Ok(Some(job))
    }

    /// Register the stop signal for a job about to be driven.
    pub(crate) fn watch(&self, job_id: DbId, submitted: bool) -> CancellationToken {
        let token = self.shutdown.child_token();
        let watch = Watch {
            token: token.clone(),
            submitted,
        };
        self.monitors().insert(job_id, watch);
        token
    }

    /// Record that the node accepted the job. Returns `false` when the job
    /// was cancelled first, in which case the interrupt is the caller's.
    pub(crate) fn mark_submitted(&self, job_id: DbId) -> bool {
        match self.monitors().get_mut(&job_id) {
            Some(watch) => {
                watch.submitted = true;
                !watch.token.is_cancelled()
            }
            None => false,
        }
    }

    /// Spawn the monitor for a job that has just been submitted or recovered.
    pub(crate) fn start_monitor(
        self: &Arc<Self>,
        job: &Job,
        node: Arc<dyn NodeClient>,
        token: CancellationToken,
    ) -> bool {
        let Some(session) = MonitorSession::attach(Arc::clone(self), job, node) else {
            return false;
        };
        self.tasks.spawn(session.run(token));
        true
    }

    /// Free the node and drop the watch of a job the engine stops driving.
    pub(crate) fn finish_monitor(&self, job_id: DbId, node: &str) {
        self.leases.release(node, job_id);
        self.monitors().remove(&job_id);
    }

    /// Record a failure for a job this engine holds, publish it, and free its node.
    pub(crate) async fn fail_job(&self, job: &Job, message: &str) {
        match self.store.fail(job.id, message).await {
            Ok(Some(failed)) => {
                tracing::warn!(job_id = job.id, node_id = %job.target_node, error = message, "Job failed");
                self.broadcaster.publish_job_update(&failed);
            }
            Ok(None) => {
                tracing::debug!(job_id = job.id, "Job already terminal, failure not recorded");
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to record job failure");
            }
        }
        self.finish_monitor(job.id, &job.target_node);
    }
}

async fn interrupt_node(node: Arc<dyn NodeClient>, job_id: DbId) {
    match node.interrupt().await {
        Ok(()) => tracing::info!(job_id, node_id = node.node_id(), "Interrupt sent to node"),
        Err(e) => tracing::warn!(
            job_id,
            node_id = node.node_id(),
            error = %e,
            "Failed to interrupt node",
        ),
    }
}
