mod common;

use axum::http::StatusCode;
use common::{body_json, build_test_app, get};

#[tokio::test]
async fn health_reports_push_observer_on_in_process_store() {
    let (app, ctx) = build_test_app().await;

    let response = get(&app, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["db_healthy"], true);
    assert_eq!(json["lock_observer"], "push");
    assert_eq!(json["lock_board_connected"], true);
    assert!(json["version"].is_string());

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn health_is_degraded_when_board_disconnects() {
    let (app, ctx) = build_test_app().await;

    ctx.realtime.cleanup_all().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let json = body_json(get(&app, "/health", None).await).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["lock_board_connected"], false);

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (app, ctx) = build_test_app().await;
    let response = get(&app, "/api/v1/nope", Some("1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn realtime_views_list_the_lock_observer() {
    let (app, ctx) = build_test_app().await;

    let stats = body_json(get(&app, "/api/v1/realtime/stats", None).await).await;
    assert_eq!(stats["data"]["enabled"], true);
    assert_eq!(stats["data"]["subscriptions"], 1);

    let duplicates = body_json(get(&app, "/api/v1/realtime/duplicates", None).await).await;
    assert_eq!(duplicates["data"], serde_json::json!([]));

    ctx.locks.shutdown().await;
}
