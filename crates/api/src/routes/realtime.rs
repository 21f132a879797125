use axum::routing::get;
use axum::Router;

use crate::handlers::realtime;
use crate::state::AppState;

/// Routes mounted at `/realtime`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(realtime::stats))
        .route("/duplicates", get(realtime::duplicates))
}
