//! Repository for the `jobs` table.
//!
//! Every lifecycle transition is a conditional `UPDATE ... WHERE status_id`
//! so that concurrent writers cannot move a job out of a terminal state.

use sqlx::PgPool;
use forgefleet_core::types::{DbId, Timestamp};

use crate::models::job::{Job, JobListQuery, NewJob};
use crate::models::status::{JobStatus, StatusId};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, status_id, target_node, generation_params, \
    session_hash, task_token, progress_percent, preview_artifact, \
    result_artifacts, error_message, completion_note, \
    retry_count, retry_of_job_id, \
    created_at, dispatched_at, completed_at, updated_at";

/// Provides CRUD and lifecycle transitions for generation jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new pending job.
    pub async fn create(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (status_id, target_node, generation_params, retry_count, retry_of_job_id) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Pending.id())
            .bind(&input.target_node)
            .bind(&input.generation_params)
            .bind(input.retry_count)
            .bind(input.retry_of_job_id)
            .fetch_one(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List jobs newest first with optional status / node filters.
    pub async fn list(pool: &PgPool, params: &JobListQuery) -> Result<Vec<Job>, sqlx::Error> {
        let mut conditions: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 1;

        if params.status.is_some() {
            conditions.push(format!("status_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if params.target_node.is_some() {
            conditions.push(format!("target_node = ${bind_idx}"));
            bind_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             {where_clause} \
             ORDER BY created_at DESC, id DESC \
             LIMIT ${bind_idx} OFFSET ${}",
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, Job>(&query);
        if let Some(status) = params.status {
            q = q.bind(status.id());
        }
        if let Some(node) = &params.target_node {
            q = q.bind(node);
        }
        q.bind(params.effective_limit())
            .bind(params.effective_offset())
            .fetch_all(pool)
            .await
    }

    /// Pending jobs created at or after `since`, oldest first.
    pub async fn list_pending(pool: &PgPool, since: Timestamp) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status_id = $1 AND created_at >= $2 \
             ORDER BY created_at ASC, id ASC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Pending.id())
            .bind(since)
            .fetch_all(pool)
            .await
    }

    /// All jobs currently in `processing`.
    pub async fn list_processing(pool: &PgPool) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs WHERE status_id = $1 ORDER BY dispatched_at ASC NULLS LAST, id ASC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Processing.id())
            .fetch_all(pool)
            .await
    }

    /// Move a pending job to `processing` and record its correlation ids.
    ///
    /// Returns `None` if the job was no longer pending.
    pub async fn claim(
        pool: &PgPool,
        id: DbId,
        session_hash: &str,
        task_token: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, session_hash = $3, task_token = $4, \
                 progress_percent = 0, dispatched_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Processing.id())
            .bind(session_hash)
            .bind(task_token)
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Raise progress (never lowers it) and optionally replace the preview.
    ///
    /// Returns `false` if the job is not processing.
    pub async fn update_progress(
        pool: &PgPool,
        id: DbId,
        percent: i16,
        preview: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET progress_percent = GREATEST(progress_percent, $2), \
                 preview_artifact = COALESCE($3, preview_artifact), \
                 updated_at = NOW() \
             WHERE id = $1 AND status_id = $4",
        )
        .bind(id)
        .bind(percent)
        .bind(preview)
        .bind(JobStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a processing job completed with its saved artifacts.
    pub async fn complete(
        pool: &PgPool,
        id: DbId,
        artifacts: &[String],
        note: Option<&str>,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, result_artifacts = $3, completion_note = $4, \
                 progress_percent = 100, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Completed.id())
            .bind(artifacts)
            .bind(note)
            .bind(JobStatus::Processing.id())
            .fetch_optional(pool)
            .await
    }

    /// Mark a pending or processing job failed.
    pub async fn fail(pool: &PgPool, id: DbId, error: &str) -> Result<Option<Job>, sqlx::Error> {
        Self::finish(pool, id, JobStatus::Failed, Some(error)).await
    }

    /// Cancel a pending or processing job.
    pub async fn cancel(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        Self::finish(pool, id, JobStatus::Cancelled, None).await
    }

    async fn finish(
        pool: &PgPool,
        id: DbId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, error_message = COALESCE($3, error_message), \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($4, $5) \
             RETURNING {COLUMNS}"
        );
        let open: [StatusId; 2] = [JobStatus::Pending.id(), JobStatus::Processing.id()];
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(status.id())
            .bind(error)
            .bind(open[0])
            .bind(open[1])
            .fetch_optional(pool)
            .await
    }
}
