//! Handlers for schedule edit locks and administrative holds.
//!
//! Writes go through the lock controller; reads come from its observer
//! board with read-time expiry applied.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use realtyops_core::error::CoreError;
use realtyops_core::schedule::{EditPermission, HoldInfo, HoldType, LockInfo, ScheduleStatus};
use realtyops_core::types::{DbId, Timestamp};
use realtyops_locking::LockStatus;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::extract::CallerId;
use crate::response::DataResponse;
use crate::state::AppState;

/// Optional body of the release endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ReleaseRequest {
    pub final_status: Option<ScheduleStatus>,
}

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    pub lock_type: HoldType,
    pub reason: Option<String>,
    pub end_time: Option<Timestamp>,
}

/// Lock state of one slot as the caller sees it.
#[derive(Debug, Serialize)]
pub struct LockView {
    pub resource_id: DbId,
    pub lock: Option<LockInfo>,
    pub locked_by_other: bool,
    pub hold: Option<HoldInfo>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

#[derive(Debug, Serialize)]
pub struct UnholdResponse {
    pub lifted: bool,
}

/// POST /api/v1/schedules/{id}/lock/acquire
pub async fn acquire(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<LockInfo>>> {
    let info = state.locks.acquire(id, caller).await?;
    Ok(Json(DataResponse { data: info }))
}

/// POST /api/v1/schedules/{id}/lock/extend
pub async fn extend(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<LockInfo>>> {
    let info = state.locks.extend(id, caller).await?;
    Ok(Json(DataResponse { data: info }))
}

/// POST /api/v1/schedules/{id}/lock/release
///
/// The body is optional; without `final_status` the slot goes back to
/// `available`, or stays `booked` if it was booked.
pub async fn release(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<DbId>,
    body: Bytes,
) -> AppResult<Json<DataResponse<ReleaseResponse>>> {
    let request: ReleaseRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ReleaseRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("Invalid release body: {e}")))?
    };

    let released = state.locks.release(id, caller, request.final_status).await?;
    Ok(Json(DataResponse {
        data: ReleaseResponse { released },
    }))
}

/// GET /api/v1/schedules/{id}/lock
pub async fn lock_info(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<LockView>>> {
    let row = state
        .locks
        .row(id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Schedule",
            id,
        }))?;
    let now = state.locks.observer().rows().now();
    let lock = row.lock_info(now);

    Ok(Json(DataResponse {
        data: LockView {
            resource_id: id,
            locked_by_other: lock.as_ref().is_some_and(|l| l.holder != caller),
            lock,
            hold: row.hold_info(),
        },
    }))
}

/// GET /api/v1/schedules/{id}/permission
pub async fn permission(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<EditPermission>>> {
    let permission = state.locks.edit_permission(id, caller).await?;
    Ok(Json(DataResponse { data: permission }))
}

/// POST /api/v1/schedules/{id}/hold
pub async fn hold(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<DbId>,
    Json(input): Json<HoldRequest>,
) -> AppResult<Json<DataResponse<HoldInfo>>> {
    let info = state
        .locks
        .hold(id, input.lock_type, input.reason, input.end_time)
        .await?;
    tracing::info!(resource_id = id, caller, lock_type = %info.lock_type, "Hold placed");
    Ok(Json(DataResponse { data: info }))
}

/// POST /api/v1/schedules/{id}/unhold
pub async fn unhold(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<UnholdResponse>>> {
    let lifted = state.locks.unhold(id).await?;
    tracing::info!(resource_id = id, caller, lifted, "Hold lift requested");
    Ok(Json(DataResponse {
        data: UnholdResponse { lifted },
    }))
}

/// GET /api/v1/locks/status
pub async fn status(State(state): State<AppState>) -> Json<DataResponse<LockStatus>> {
    Json(DataResponse {
        data: state.locks.status(),
    })
}
