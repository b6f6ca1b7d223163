use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use forgefleet_core::error::CoreError;

/// Handler error. Serialized as `{"error": <message>, "code": <CODE>}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Lookup by a non-numeric key (node ids) came up empty.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A compute node failed or answered with an error.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

type Parts = (StatusCode, &'static str, String);

const INTERNAL_MESSAGE: &str = "An internal error occurred";

fn internal() -> Parts {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        INTERNAL_MESSAGE.to_string(),
    )
}

impl AppError {
    /// Status, machine code and client-facing message. Internal details
    /// are logged here and never returned.
    fn parts(&self) -> Parts {
        match self {
            AppError::Core(CoreError::NotFound { entity, id }) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{entity} {id} does not exist"),
            ),
            AppError::Core(CoreError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Core(CoreError::Conflict(msg)) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone())
            }
            AppError::Core(CoreError::Internal(msg)) | AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
            AppError::Database(err) => classify_sqlx_error(err),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Upstream(msg) => {
                tracing::warn!(error = %msg, "Node request failed");
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, error) = self.parts();
        (status, Json(ErrorBody { error, code })).into_response()
    }
}

/// Map store errors onto HTTP.
///
/// A unique violation on a `uq_` constraint is a lost race (e.g. a second
/// processing job for the same node) and surfaces as 409.
fn classify_sqlx_error(err: &sqlx::Error) -> Parts {
    if let sqlx::Error::RowNotFound = err {
        return (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource not found".to_string(),
        );
    }

    let unique_violation = err.as_database_error().and_then(|db_err| {
        let constraint = db_err.constraint()?;
        (db_err.code().as_deref() == Some("23505") && constraint.starts_with("uq_"))
            .then(|| constraint.to_string())
    });
    if let Some(constraint) = unique_violation {
        return (
            StatusCode::CONFLICT,
            "CONFLICT",
            format!("Conflicting job state ({constraint})"),
        );
    }

    tracing::error!(error = %err, "Job store error");
    internal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_client_statuses() {
        let not_found = AppError::Core(CoreError::NotFound { entity: "Job", id: 9 });
        assert_eq!(not_found.parts().0, StatusCode::NOT_FOUND);

        let conflict = AppError::Core(CoreError::Conflict("terminal".into()));
        assert_eq!(conflict.parts().1, "CONFLICT");
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = AppError::InternalError("disk on fire at /var/lib".into());
        let (status, code, message) = err.parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "INTERNAL_ERROR");
        assert_eq!(message, INTERNAL_MESSAGE);
    }

    #[test]
    fn row_not_found_is_404() {
        let (status, _, _) = AppError::Database(sqlx::Error::RowNotFound).parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
