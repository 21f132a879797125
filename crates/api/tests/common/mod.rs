use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use realtyops_core::clock::{SharedClock, SystemClock};
use realtyops_locking::{EditLockManager, InMemoryScheduleStore, LockConfig, LockController};
use realtyops_realtime::memory::LocalPushSource;
use realtyops_realtime::{RealtimeConfig, RealtimeManager};
use tower::ServiceExt;

use realtyops_api::config::{server_lock_config, ServerConfig};
use realtyops_api::router::build_app_router;
use realtyops_api::state::AppState;

/// Handles a test needs besides the router.
pub struct TestContext {
    pub store: Arc<InMemoryScheduleStore>,
    pub realtime: RealtimeManager,
    pub locks: LockController,
}

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    }
}

/// Build the full application router on the in-process store and push
/// source, with the same middleware stack the binary uses.
pub async fn build_test_app() -> (Router, TestContext) {
    build_test_app_with_clock(Arc::new(SystemClock)).await
}

/// Same as [`build_test_app`], with lease deadlines read from `clock`.
pub async fn build_test_app_with_clock(clock: SharedClock) -> (Router, TestContext) {
    let config = test_config();
    let source = LocalPushSource::new();
    let store = Arc::new(InMemoryScheduleStore::new().with_push(source.clone(), Arc::clone(&clock)));

    let realtime = RealtimeManager::new(RealtimeConfig::default(), Arc::new(source));
    let manager = EditLockManager::new(store.clone(), clock, server_lock_config(LockConfig::default()));
    let locks = LockController::connect(manager, Some(&realtime), "api-test").await;

    let state = AppState {
        pool: None,
        config: Arc::new(config.clone()),
        realtime: realtime.clone(),
        locks: locks.clone(),
    };
    let app = build_app_router(state, &config);

    (
        app,
        TestContext {
            store,
            realtime,
            locks,
        },
    )
}

/// Send a request as `user` (no `X-User-Id` header when `None`).
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

pub async fn get(app: &Router, uri: &str, user: Option<&str>) -> Response {
    send(app, Method::GET, uri, user, None).await
}

pub async fn post(app: &Router, uri: &str, user: &str) -> Response {
    send(app, Method::POST, uri, Some(user), None).await
}

pub async fn post_json(app: &Router, uri: &str, user: &str, body: serde_json::Value) -> Response {
    send(app, Method::POST, uri, Some(user), Some(body)).await
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
