//! Restart recovery.
//!
//! Jobs left `processing` by a previous run get their lease back and a
//! fresh monitor attached from the stored correlation ids. A node that
//! forgot the session surfaces as a stream-open failure in the monitor.

use std::sync::Arc;

use super::Engine;

impl Engine {
    /// Returns the number of monitors re-attached.
    pub(crate) async fn recover(self: &Arc<Self>) -> Result<usize, sqlx::Error> {
        let processing = self.store.list_processing().await?;
        let mut reattached = 0;

        for job in processing {
            let Some(node) = self.nodes.get(&job.target_node) else {
                let message = format!(
                    "Recovery error: node '{}' is no longer configured",
                    job.target_node
                );
                self.fail_job(&job, &message).await;
                continue;
            };
            if job.session_hash.is_none() || job.task_token.is_none() {
                self.fail_job(&job, "Recovery error: job has no stored correlation ids")
                    .await;
                continue;
            }
            if !self.leases.try_acquire(&job.target_node, job.id) {
                self.fail_job(&job, "Recovery error: node already leased to another job")
                    .await;
                continue;
            }
            let token = self.watch(job.id, true);
            if self.start_monitor(&job, node, token) {
                tracing::info!(job_id = job.id, node_id = %job.target_node, "Monitor re-attached");
                reattached += 1;
            } else {
                self.fail_job(&job, "Recovery error: monitor could not attach")
                    .await;
            }
        }

        Ok(reattached)
    }
}
