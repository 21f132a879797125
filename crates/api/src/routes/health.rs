use axum::extract::State;
use axum::{routing::get, Json, Router};
use realtyops_locking::ObserverMode;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the database is reachable; always `true` on the in-process store.
    pub db_healthy: bool,
    /// How the lock board is kept current.
    pub lock_observer: ObserverMode,
    /// Connectivity indicator of the lock board.
    pub lock_board_connected: bool,
}

/// GET /health -- returns service, database, and lock board health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = match &state.pool {
        Some(pool) => realtyops_db::health_check(pool).await.is_ok(),
        None => true,
    };
    let lock_board_connected = state.locks.is_connected();

    let status = if db_healthy && lock_board_connected {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        lock_observer: state.locks.mode(),
        lock_board_connected,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
