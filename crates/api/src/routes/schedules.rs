//! Route definitions for the `/schedules` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::locks;
use crate::state::AppState;

/// Routes mounted at `/schedules`.
///
/// ```text
/// GET    /{id}/lock           -> lock_info
/// POST   /{id}/lock/acquire   -> acquire
/// POST   /{id}/lock/extend    -> extend
/// POST   /{id}/lock/release   -> release
/// GET    /{id}/permission     -> permission
/// POST   /{id}/hold           -> hold
/// POST   /{id}/unhold         -> unhold
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/lock", get(locks::lock_info))
        .route("/{id}/lock/acquire", post(locks::acquire))
        .route("/{id}/lock/extend", post(locks::extend))
        .route("/{id}/lock/release", post(locks::release))
        .route("/{id}/permission", get(locks::permission))
        .route("/{id}/hold", post(locks::hold))
        .route("/{id}/unhold", post(locks::unhold))
}
