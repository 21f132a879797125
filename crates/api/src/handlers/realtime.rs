//! Read-only views of the realtime subscription pool.

use axum::extract::State;
use axum::Json;
use realtyops_realtime::registry::DuplicateGroup;
use realtyops_realtime::stats::RealtimeStats;

use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/realtime/stats
pub async fn stats(State(state): State<AppState>) -> Json<DataResponse<RealtimeStats>> {
    Json(DataResponse {
        data: state.realtime.stats(),
    })
}

/// GET /api/v1/realtime/duplicates
///
/// Live subscriptions that listen for the same thing under different
/// subscribers or origins.
pub async fn duplicates(State(state): State<AppState>) -> Json<DataResponse<Vec<DuplicateGroup>>> {
    Json(DataResponse {
        data: state.realtime.find_duplicate_subscriptions(),
    })
}
