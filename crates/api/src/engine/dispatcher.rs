//! Dispatch cycle.
//!
//! Runs on a fixed interval. Each cycle hands at most one pending job to
//! each free node: lease the node, claim the job, resolve the requested
//! checkpoint, build the queue payload and submit it. Any failure after
//! the claim fails the job immediately; nothing is retried automatically.
//!
//! The dispatching task owns the node lease until the monitor takes over.
//! A cancel in the meantime only trips the job's token: the job is
//! dropped before submission, or interrupted on the node if it lost the
//! race with the submit.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use forgefleet_db::models::job::Job;
use forgefleet_node::catalog::CatalogMatch;
use forgefleet_node::client::NodeClient;
use forgefleet_node::payload::{build_request, requested_model, SubmissionIds};

use super::{interrupt_node, Engine};

impl Engine {
    /// Run the dispatcher loop until shutdown.
    pub(crate) async fn run_dispatcher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.dispatch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.dispatch_interval.as_millis() as u64,
            nodes = self.nodes.len(),
            "Job dispatcher started",
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Job dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_cycle().await {
                        tracing::error!(error = %e, "Dispatch cycle failed");
                    }
                }
            }
        }
    }

    /// One dispatch cycle. Returns the number of jobs submitted.
    pub async fn dispatch_cycle(self: &Arc<Self>) -> Result<usize, sqlx::Error> {
        let mut free: BTreeSet<String> = self.leases.free_nodes().into_iter().collect();
        if free.is_empty() {
            return Ok(0);
        }

        let pending = self.store.list_pending(self.pending_since()).await?;
        let mut submitted = 0;

        for job in pending {
            if free.is_empty() {
                break;
            }
            let Some(node) = self.nodes.get(&job.target_node) else {
                self.reject_unroutable(&job).await;
                continue;
            };
            // One job per free node per cycle; busy nodes keep their queue.
            if !free.remove(&job.target_node) {
                continue;
            }
            if self.dispatch_one(job, node).await {
                submitted += 1;
            }
        }

        Ok(submitted)
    }

    fn pending_since(&self) -> DateTime<Utc> {
        self.config
            .pending_window
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    async fn reject_unroutable(&self, job: &Job) {
        let message = format!(
            "Configuration error: node '{}' is not configured",
            job.target_node
        );
        match self.store.fail(job.id, &message).await {
            Ok(Some(failed)) => {
                tracing::warn!(job_id = job.id, node_id = %job.target_node, "Pending job targets an unknown node");
                self.broadcaster.publish_job_update(&failed);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(job_id = job.id, error = %e, "Failed to reject unroutable job"),
        }
    }

    /// Lease, claim, resolve, build and submit a single job.
    async fn dispatch_one(self: &Arc<Self>, job: Job, node: Arc<dyn NodeClient>) -> bool {
        let node_id = node.node_id().to_string();
        if !self.leases.try_acquire(&node_id, job.id) {
            return false;
        }
        // Registered before the claim so a concurrent cancel signals this
        // task instead of releasing the lease under it.
        let cancel = self.watch(job.id, false);

        let ids = SubmissionIds::generate();
        let claimed = match self
            .store
            .claim(job.id, &ids.session_hash, &ids.task_token)
            .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                tracing::debug!(job_id = job.id, "Job no longer pending, skipping");
                self.finish_monitor(job.id, &node_id);
                return false;
            }
            Err(e) => {
                tracing::error!(job_id = job.id, node_id = %node_id, error = %e, "Failed to claim job");
                self.finish_monitor(job.id, &node_id);
                return false;
            }
        };
        tracing::info!(job_id = claimed.id, node_id = %node_id, "Job claimed");
        self.broadcaster.publish_job_update(&claimed);

        let model_title = match requested_model(&claimed.generation_params) {
            None => None,
            Some(requested) => match self.catalog.resolve(node.as_ref(), requested).await {
                Ok(CatalogMatch::Found { title, strategy }) => {
                    tracing::debug!(
                        job_id = claimed.id,
                        requested,
                        resolved = %title,
                        ?strategy,
                        "Checkpoint resolved",
                    );
                    Some(title)
                }
                Ok(CatalogMatch::NotFound) => {
                    let message = format!(
                        "Configuration error: model '{requested}' is not available on node '{node_id}'"
                    );
                    self.fail_job(&claimed, &message).await;
                    return false;
                }
                Err(e) => {
                    let message = format!(
                        "Transport error: model lookup on node '{node_id}' failed: {e}"
                    );
                    self.fail_job(&claimed, &message).await;
                    return false;
                }
            },
        };

        let request = match build_request(
            node.fn_index(),
            &ids,
            &claimed.generation_params,
            model_title.as_deref(),
        ) {
            Ok(request) => request,
            Err(e) => {
                self.fail_job(&claimed, &format!("Configuration error: {e}")).await;
                return false;
            }
        };

        if self.cancelled_before_submit(&claimed, &cancel).await {
            tracing::info!(job_id = claimed.id, node_id = %node_id, "Job cancelled before submission");
            self.finish_monitor(claimed.id, &node_id);
            return false;
        }

        match node.submit(&request).await {
            Ok(ack) => {
                tracing::info!(
                    job_id = claimed.id,
                    node_id = %node_id,
                    session_hash = %ids.session_hash,
                    event_id = ack.event_id.as_deref().unwrap_or("-"),
                    "Job submitted to node",
                );
                if !self.mark_submitted(claimed.id) {
                    tracing::info!(
                        job_id = claimed.id,
                        node_id = %node_id,
                        "Job cancelled during submission, interrupting node",
                    );
                    interrupt_node(Arc::clone(&node), claimed.id).await;
                    self.finish_monitor(claimed.id, &node_id);
                    return false;
                }
                if !self.start_monitor(&claimed, node, cancel) {
                    self.fail_job(&claimed, "Internal error: job has no correlation ids")
                        .await;
                    return false;
                }
                true
            }
            Err(e) => {
                let message =
                    format!("Transport error: submission to node '{node_id}' failed: {e}");
                self.fail_job(&claimed, &message).await;
                false
            }
        }
    }

    /// Whether the job was cancelled while it was being prepared. A store
    /// read failure lets the submission go ahead.
    async fn cancelled_before_submit(&self, job: &Job, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        match self.store.find_by_id(job.id).await {
            Ok(Some(current)) => current.is_terminal(),
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Failed to re-check job before submission");
                false
            }
        }
    }
}
