//! The job store seam.
//!
//! The engine only talks to [`JobStore`]. [`PgJobStore`] delegates to
//! [`JobRepo`]; [`MemoryJobStore`] keeps the same conditional-transition
//! semantics in process and backs tests and database-less deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use forgefleet_core::types::{DbId, Timestamp};

use crate::models::job::{Job, JobListQuery, NewJob};
use crate::models::status::JobStatus;
use crate::repositories::JobRepo;
use crate::DbPool;

/// Durable storage for generation jobs.
///
/// Transition methods are conditional: they return `None` / `false` when
/// the job is not in a state the transition applies to.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, input: &NewJob) -> Result<Job, sqlx::Error>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, sqlx::Error>;

    async fn list(&self, params: &JobListQuery) -> Result<Vec<Job>, sqlx::Error>;

    /// Pending jobs created at or after `since`, oldest first.
    async fn list_pending(&self, since: Timestamp) -> Result<Vec<Job>, sqlx::Error>;

    async fn list_processing(&self) -> Result<Vec<Job>, sqlx::Error>;

    /// `pending -> processing`, recording the node correlation ids.
    async fn claim(
        &self,
        id: DbId,
        session_hash: &str,
        task_token: &str,
    ) -> Result<Option<Job>, sqlx::Error>;

    /// Monotonic progress write for a processing job.
    async fn update_progress(
        &self,
        id: DbId,
        percent: i16,
        preview: Option<&str>,
    ) -> Result<bool, sqlx::Error>;

    /// `processing -> completed`.
    async fn complete(
        &self,
        id: DbId,
        artifacts: &[String],
        note: Option<&str>,
    ) -> Result<Option<Job>, sqlx::Error>;

    /// `pending | processing -> failed`.
    async fn fail(&self, id: DbId, error: &str) -> Result<Option<Job>, sqlx::Error>;

    /// `pending | processing -> cancelled`.
    async fn cancel(&self, id: DbId) -> Result<Option<Job>, sqlx::Error>;

    /// Reachability check for the health endpoint.
    async fn ping(&self) -> Result<(), sqlx::Error>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// [`JobStore`] backed by the `jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, input: &NewJob) -> Result<Job, sqlx::Error> {
        JobRepo::create(&self.pool, input).await
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::find_by_id(&self.pool, id).await
    }

    async fn list(&self, params: &JobListQuery) -> Result<Vec<Job>, sqlx::Error> {
        JobRepo::list(&self.pool, params).await
    }

    async fn list_pending(&self, since: Timestamp) -> Result<Vec<Job>, sqlx::Error> {
        JobRepo::list_pending(&self.pool, since).await
    }

    async fn list_processing(&self) -> Result<Vec<Job>, sqlx::Error> {
        JobRepo::list_processing(&self.pool).await
    }

    async fn claim(
        &self,
        id: DbId,
        session_hash: &str,
        task_token: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::claim(&self.pool, id, session_hash, task_token).await
    }

    async fn update_progress(
        &self,
        id: DbId,
        percent: i16,
        preview: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        JobRepo::update_progress(&self.pool, id, percent, preview).await
    }

    async fn complete(
        &self,
        id: DbId,
        artifacts: &[String],
        note: Option<&str>,
    ) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::complete(&self.pool, id, artifacts, note).await
    }

    async fn fail(&self, id: DbId, error: &str) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::fail(&self.pool, id, error).await
    }

    async fn cancel(&self, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        JobRepo::cancel(&self.pool, id).await
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        crate::health_check(&self.pool).await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    next_id: DbId,
    jobs: BTreeMap<DbId, Job>,
}

/// Process-local [`JobStore`]. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed row, bypassing lifecycle rules. Test seeding only.
    pub async fn insert_raw(&self, job: Job) {
        let mut state = self.state.write().await;
        state.next_id = state.next_id.max(job.id);
        state.jobs.insert(job.id, job);
    }
}

fn has_status(job: &Job, allowed: &[JobStatus]) -> bool {
    job.status().is_some_and(|s| allowed.contains(&s))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, input: &NewJob) -> Result<Job, sqlx::Error> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let now = Utc::now();
        let job = Job {
            id: state.next_id,
            status_id: JobStatus::Pending.id(),
            target_node: input.target_node.clone(),
            generation_params: input.generation_params.clone(),
            session_hash: None,
            task_token: None,
            progress_percent: 0,
            preview_artifact: None,
            result_artifacts: Vec::new(),
            error_message: None,
            completion_note: None,
            retry_count: input.retry_count,
            retry_of_job_id: input.retry_of_job_id,
            created_at: now,
            dispatched_at: None,
            completed_at: None,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn list(&self, params: &JobListQuery) -> Result<Vec<Job>, sqlx::Error> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| params.status.map_or(true, |s| j.status_id == s.id()))
            .filter(|j| {
                params
                    .target_node
                    .as_ref()
                    .map_or(true, |n| &j.target_node == n)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs
            .into_iter()
            .skip(params.effective_offset() as usize)
            .take(params.effective_limit() as usize)
            .collect())
    }

    async fn list_pending(&self, since: Timestamp) -> Result<Vec<Job>, sqlx::Error> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status_id == JobStatus::Pending.id() && j.created_at >= since)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn list_processing(&self) -> Result<Vec<Job>, sqlx::Error> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status_id == JobStatus::Processing.id())
            .cloned()
            .collect())
    }

    async fn claim(
        &self,
        id: DbId,
        session_hash: &str,
        task_token: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let mut state = self.state.write().await;
        let Some(target) = state.jobs.get(&id).map(|j| j.target_node.clone()) else {
            return Ok(None);
        };
        // Mirrors the partial unique index on (target_node) WHERE processing.
        let node_busy = state
            .jobs
            .values()
            .any(|j| j.id != id && j.target_node == target && j.status_id == JobStatus::Processing.id());
        if node_busy {
            return Ok(None);
        }
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !has_status(job, &[JobStatus::Pending]) {
            return Ok(None);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Processing.id();
        job.session_hash = Some(session_hash.to_string());
        job.task_token = Some(task_token.to_string());
        job.progress_percent = 0;
        job.dispatched_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update_progress(
        &self,
        id: DbId,
        percent: i16,
        preview: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !has_status(job, &[JobStatus::Processing]) {
            return Ok(false);
        }
        job.progress_percent = job.progress_percent.max(percent);
        if let Some(preview) = preview {
            job.preview_artifact = Some(preview.to_string());
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(
        &self,
        id: DbId,
        artifacts: &[String],
        note: Option<&str>,
    ) -> Result<Option<Job>, sqlx::Error> {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !has_status(job, &[JobStatus::Processing]) {
            return Ok(None);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Completed.id();
        job.result_artifacts = artifacts.to_vec();
        job.completion_note = note.map(str::to_string);
        job.progress_percent = 100;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn fail(&self, id: DbId, error: &str) -> Result<Option<Job>, sqlx::Error> {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !has_status(job, &[JobStatus::Pending, JobStatus::Processing]) {
            return Ok(None);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Failed.id();
        job.error_message = Some(error.to_string());
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn cancel(&self, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !has_status(job, &[JobStatus::Pending, JobStatus::Processing]) {
            return Ok(None);
        }
        let now = Utc::now();
        job.status_id = JobStatus::Cancelled.id();
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        Ok(())
    }
}
