//! Generation job entity and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use forgefleet_core::types::{DbId, NodeId, Timestamp};

use super::status::{JobStatus, StatusId};

/// A row from the `jobs` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub status_id: StatusId,
    pub target_node: NodeId,
    pub generation_params: serde_json::Value,
    /// Correlation id of the node-side event session, set when dispatched.
    pub session_hash: Option<String>,
    /// Task token embedded in the submission payload, set when dispatched.
    pub task_token: Option<String>,
    pub progress_percent: i16,
    pub preview_artifact: Option<String>,
    pub result_artifacts: Vec<String>,
    pub error_message: Option<String>,
    pub completion_note: Option<String>,
    pub retry_count: i32,
    pub retry_of_job_id: Option<DbId>,
    pub created_at: Timestamp,
    pub dispatched_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl Job {
    /// Typed status. `None` only if the row carries an unknown id.
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_id(self.status_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(JobStatus::is_terminal)
    }
}

/// DTO for `POST /api/v1/jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJob {
    pub target_node: NodeId,
    #[serde(default = "empty_params")]
    pub generation_params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Insert shape for a new pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub target_node: NodeId,
    pub generation_params: serde_json::Value,
    pub retry_count: i32,
    pub retry_of_job_id: Option<DbId>,
}

impl From<SubmitJob> for NewJob {
    fn from(input: SubmitJob) -> Self {
        Self {
            target_node: input.target_node,
            generation_params: input.generation_params,
            retry_count: 0,
            retry_of_job_id: None,
        }
    }
}

impl NewJob {
    /// A fresh pending job carrying the parameters of `original`.
    pub fn retry_of(original: &Job) -> Self {
        Self {
            target_node: original.target_node.clone(),
            generation_params: original.generation_params.clone(),
            retry_count: original.retry_count + 1,
            retry_of_job_id: Some(original.id),
        }
    }
}

/// Query parameters for `GET /api/v1/jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobListQuery {
    /// Filter by lifecycle status name (e.g. `pending`, `failed`).
    pub status: Option<JobStatus>,
    /// Filter by target node id.
    pub target_node: Option<NodeId>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

/// Maximum page size for job listing.
pub const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
pub const DEFAULT_LIMIT: i64 = 50;

impl JobListQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}
