use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use realtyops_core::error::CoreError;
use realtyops_locking::LockError;
use realtyops_realtime::RealtimeError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to produce `{ "error", "code" }` JSON bodies.
/// Lock contention carries the holder so the UI can say who to ask.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = match self {
            AppError::Lock(LockError::AlreadyLocked {
                resource_id,
                held_by,
                expires_at,
            }) => {
                let message = format!("Schedule {resource_id} is being edited by user {held_by}");
                return (
                    StatusCode::CONFLICT,
                    axum::Json(json!({
                        "error": message,
                        "code": "LOCKED",
                        "held_by": held_by,
                        "expires_at": expires_at,
                    })),
                )
                    .into_response();
            }
            AppError::Lock(err @ LockError::Held { .. }) => (StatusCode::CONFLICT, "HELD", err.to_string()),
            AppError::Lock(err @ LockError::NotHolder { .. }) => {
                (StatusCode::FORBIDDEN, "NOT_HOLDER", err.to_string())
            }
            AppError::Lock(err) => classify_core(err.into()),
            AppError::Realtime(err @ RealtimeError::PoolExhausted { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "POOL_EXHAUSTED", err.to_string())
            }
            AppError::Realtime(err @ RealtimeError::Disabled) => {
                (StatusCode::SERVICE_UNAVAILABLE, "REALTIME_DISABLED", err.to_string())
            }
            AppError::Realtime(err) => classify_core(err.into()),
            AppError::Core(core) => classify_core(core),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
        };

        let (status, code, message) = body;
        (
            status,
            axum::Json(json!({
                "error": message,
                "code": code,
            })),
        )
            .into_response()
    }
}

fn classify_core(err: CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
        CoreError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
        CoreError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
        CoreError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            )
        }
    }
}
