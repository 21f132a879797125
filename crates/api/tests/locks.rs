mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, build_test_app, build_test_app_with_clock, get, post, post_json};
use realtyops_core::clock::TokioClock;
use realtyops_core::schedule::ScheduleStatus;
use serde_json::json;

// ---------------------------------------------------------------------------
// Caller identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_user_header_is_unauthorized() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();

    let response = get(&app, &format!("/api/v1/schedules/{id}/lock"), None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn malformed_user_header_is_bad_request() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();

    for value in ["abc", "0", "-4"] {
        let response = get(&app, &format!("/api/v1/schedules/{id}/lock"), Some(value)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "header {value}");
    }

    ctx.locks.shutdown().await;
}

// ---------------------------------------------------------------------------
// Acquire / extend / release
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_editor_is_told_who_holds_the_slot() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["resource_id"], id);
    assert_eq!(json["data"]["holder"], 1);
    assert!(json["data"]["expires_at"].is_string());

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "2").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["code"], "LOCKED");
    assert_eq!(json["held_by"], 1);

    let view = body_json(get(&app, &format!("/api/v1/schedules/{id}/lock"), Some("2")).await).await;
    assert_eq!(view["data"]["locked_by_other"], true);
    assert_eq!(view["data"]["lock"]["holder"], 1);

    let view = body_json(get(&app, &format!("/api/v1/schedules/{id}/lock"), Some("1")).await).await;
    assert_eq!(view["data"]["locked_by_other"], false);

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn acquire_unknown_schedule_is_not_found() {
    let (app, ctx) = build_test_app().await;

    let response = post(&app, "/api/v1/schedules/999/lock/acquire", "1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&app, "/api/v1/schedules/999/lock", Some("1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn extend_by_non_holder_is_forbidden() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();
    post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/extend"), "1").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/extend"), "2").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "NOT_HOLDER");

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn release_without_body_frees_the_slot() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();
    post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/release"), "1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["released"], true);
    assert_eq!(ctx.store.get(id).unwrap().status, ScheduleStatus::Available);

    let view = body_json(get(&app, &format!("/api/v1/schedules/{id}/lock"), Some("2")).await).await;
    assert!(view["data"]["lock"].is_null());

    // Releasing again is a no-op.
    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/release"), "1").await;
    assert_eq!(body_json(response).await["data"]["released"], false);

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn release_with_final_status_books_the_slot() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();
    post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;

    let response = post_json(
        &app,
        &format!("/api/v1/schedules/{id}/lock/release"),
        "1",
        json!({ "final_status": "booked" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(ctx.store.get(id).unwrap().status, ScheduleStatus::Booked);

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn release_to_editing_is_rejected() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();
    post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;

    let response = post_json(
        &app,
        &format!("/api/v1/schedules/{id}/lock/release"),
        "1",
        json!({ "final_status": "editing" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    assert_eq!(ctx.store.get(id).unwrap().editing_by, Some(1));

    ctx.locks.shutdown().await;
}

// ---------------------------------------------------------------------------
// Lease expiry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn silent_client_loses_lease_at_expiry() {
    let (app, ctx) = build_test_app_with_clock(Arc::new(TokioClock::new())).await;
    let id = ctx.store.create_available();

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;
    assert_eq!(response.status(), StatusCode::OK);

    // The client never calls again.
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;

    let row = ctx.store.get(id).unwrap();
    assert_eq!(row.status, ScheduleStatus::Available);
    assert_eq!(row.editing_by, None);
    assert!(ctx.locks.manager().held().is_empty());

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "2").await;
    assert_eq!(response.status(), StatusCode::OK);

    ctx.locks.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn client_that_extends_keeps_its_lease() {
    let (app, ctx) = build_test_app_with_clock(Arc::new(TokioClock::new())).await;
    let id = ctx.store.create_available();
    post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(200)).await;
        let response = post(&app, &format!("/api/v1/schedules/{id}/lock/extend"), "1").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "2").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    ctx.locks.shutdown().await;
}

// ---------------------------------------------------------------------------
// Permission and holds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn permission_follows_the_lease() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();

    let json = body_json(get(&app, &format!("/api/v1/schedules/{id}/permission"), Some("2")).await).await;
    assert_eq!(json["data"]["outcome"], "allowed");

    post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;

    let json = body_json(get(&app, &format!("/api/v1/schedules/{id}/permission"), Some("2")).await).await;
    assert_eq!(json["data"]["outcome"], "denied");
    assert!(json["data"]["reason"].is_string());

    let json = body_json(get(&app, &format!("/api/v1/schedules/{id}/permission"), Some("1")).await).await;
    assert_eq!(json["data"]["outcome"], "allowed");

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn held_slot_cannot_be_acquired_until_lifted() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();

    let response = post_json(
        &app,
        &format!("/api/v1/schedules/{id}/hold"),
        "9",
        json!({ "lock_type": "maintenance", "reason": "studio rewiring" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["lock_type"], "maintenance");
    assert_eq!(json["data"]["reason"], "studio rewiring");

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "HELD");

    let view = body_json(get(&app, &format!("/api/v1/schedules/{id}/lock"), Some("1")).await).await;
    assert_eq!(view["data"]["hold"]["lock_type"], "maintenance");

    let response = post(&app, &format!("/api/v1/schedules/{id}/unhold"), "9").await;
    assert_eq!(body_json(response).await["data"]["lifted"], true);

    let response = post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "1").await;
    assert_eq!(response.status(), StatusCode::OK);

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn hold_of_type_none_is_rejected() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();

    let response = post_json(
        &app,
        &format!("/api/v1/schedules/{id}/hold"),
        "9",
        json!({ "lock_type": "none" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    ctx.locks.shutdown().await;
}

#[tokio::test]
async fn lock_status_lists_leases_held_by_this_server() {
    let (app, ctx) = build_test_app().await;
    let id = ctx.store.create_available();
    post(&app, &format!("/api/v1/schedules/{id}/lock/acquire"), "3").await;

    let json = body_json(get(&app, "/api/v1/locks/status", None).await).await;
    assert_eq!(json["data"]["mode"], "push");
    assert_eq!(json["data"]["connected"], true);
    let held = json["data"]["held"].as_array().unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0]["resource_id"], id);

    ctx.locks.shutdown().await;
}
