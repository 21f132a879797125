pub mod health;
pub mod realtime;
pub mod schedules;

use axum::routing::get;
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /schedules/{id}/lock                  lock view (GET)
/// /schedules/{id}/lock/acquire          take the edit lease (POST)
/// /schedules/{id}/lock/extend           push the deadline out (POST)
/// /schedules/{id}/lock/release          give the lease up (POST)
/// /schedules/{id}/permission            may the caller edit (GET)
/// /schedules/{id}/hold                  place an administrative hold (POST)
/// /schedules/{id}/unhold                lift it (POST)
///
/// /locks/status                         observer mode and local lock set (GET)
///
/// /realtime/stats                       pool snapshot (GET)
/// /realtime/duplicates                  overlapping subscriptions (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/schedules", schedules::router())
        .nest("/realtime", realtime::router())
        .route("/locks/status", get(handlers::locks::status))
}
