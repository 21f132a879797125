use std::sync::Arc;

use realtyops_locking::LockController;
use realtyops_realtime::RealtimeManager;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; every field is an `Arc` or a handle around one.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool, absent when running on the in-process store.
    pub pool: Option<realtyops_db::DbPool>,
    pub config: Arc<ServerConfig>,
    /// Realtime subscription pool.
    pub realtime: RealtimeManager,
    /// Edit-lock protocol plus the observer it runs with.
    pub locks: LockController,
}
