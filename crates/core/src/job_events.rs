//! Status stream message type constants.
//!
//! Used as the `type` discriminator of every message pushed to status
//! subscribers (WebSocket clients and in-process observers).

/// A job record changed (status, correlation ids, results, error).
pub const MSG_TYPE_JOB_UPDATE: &str = "job_update";

/// Progress update during job execution (percentage + preview reference).
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";
