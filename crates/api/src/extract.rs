//! Caller identity extractor.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use realtyops_core::error::CoreError;
use realtyops_core::types::DbId;

use crate::error::AppError;

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The operator making the request, taken from the `X-User-Id` header.
///
/// Authentication happens upstream; this only parses the id it forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub DbId);

impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Core(CoreError::Unauthorized("Missing X-User-Id header".into())))?;

        raw.trim()
            .parse::<DbId>()
            .ok()
            .filter(|id| *id > 0)
            .map(CallerId)
            .ok_or_else(|| AppError::BadRequest(format!("X-User-Id must be a positive integer, got {raw:?}")))
    }
}
