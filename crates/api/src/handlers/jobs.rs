//! Handlers for the `/jobs` resource.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use forgefleet_core::error::CoreError;
use forgefleet_core::types::DbId;
use forgefleet_db::models::job::{Job, JobListQuery, NewJob, SubmitJob};
use forgefleet_db::models::status::JobStatus;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn find_job(state: &AppState, job_id: DbId) -> AppResult<Job> {
    state
        .store
        .find_by_id(job_id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Job",
            id: job_id,
        }))
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Queue a generation job for a node. Returns 201 with the pending job.
/// The dispatcher picks it up once the node is free.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    if !state.engine.nodes().contains(&input.target_node) {
        return Err(AppError::BadRequest(format!(
            "Unknown target_node '{}'",
            input.target_node
        )));
    }
    if !input.generation_params.is_object() {
        return Err(AppError::Core(CoreError::Validation(
            "generation_params must be a JSON object".into(),
        )));
    }

    let job = state.store.create(&NewJob::from(input)).await?;
    state.broadcaster.publish_job_update(&job);

    tracing::info!(job_id = job.id, node_id = %job.target_node, "Job submitted");

    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// Newest first. Optional `status`, `target_node`, `limit` and `offset`.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.store.list(&params).await?;
    Ok(Json(DataResponse { data: jobs }))
}

// ---------------------------------------------------------------------------
// Get
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = find_job(&state, job_id).await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Cancel a pending or processing job. Returns 409 if the job is already
/// terminal.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    find_job(&state, job_id).await?;

    let cancelled = state.engine.cancel_job(job_id).await?.ok_or_else(|| {
        AppError::Core(CoreError::Conflict(
            "Job is already in a terminal state and cannot be cancelled".into(),
        ))
    })?;

    Ok(Json(DataResponse { data: cancelled }))
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/retry
///
/// Create a new pending job from a failed or cancelled job's parameters.
/// The new job points back through `retry_of_job_id`. This is the only
/// way a job is ever resubmitted.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let original = find_job(&state, job_id).await?;

    if !matches!(
        original.status(),
        Some(JobStatus::Failed | JobStatus::Cancelled)
    ) {
        return Err(AppError::BadRequest(
            "Only failed or cancelled jobs can be retried".into(),
        ));
    }

    let new_job = state.store.create(&NewJob::retry_of(&original)).await?;
    state.broadcaster.publish_job_update(&new_job);

    tracing::info!(
        original_job_id = job_id,
        new_job_id = new_job.id,
        retry_count = new_job.retry_count,
        "Job retried",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: new_job })))
}
