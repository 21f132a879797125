//! Live-stream schedule slot model and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use realtyops_core::schedule::{ScheduleRow, ScheduleStatus};
use realtyops_core::store::StoreError;
use realtyops_core::types::{DbId, Timestamp};

/// A row from the `live_stream_schedules` table.
///
/// `status` and `lock_type` are stored as text; use [`ScheduleRecord::into_row`]
/// to obtain the typed domain row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ScheduleRecord {
    pub id: DbId,
    pub status: String,
    pub created_by: Option<DbId>,
    pub participant_ids: Vec<DbId>,
    pub editing_by: Option<DbId>,
    pub editing_at: Option<Timestamp>,
    pub editing_expires_at: Option<Timestamp>,
    pub pre_edit_status: Option<String>,
    pub lock_type: String,
    pub lock_reason: Option<String>,
    pub lock_end_time: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ScheduleRecord {
    pub fn into_row(self) -> Result<ScheduleRow, StoreError> {
        let invalid = |reason: String| StoreError::InvalidRow {
            id: self.id,
            reason,
        };
        let status = self.status.parse().map_err(|e| invalid(format!("{e}")))?;
        let lock_type = self.lock_type.parse().map_err(|e| invalid(format!("{e}")))?;
        let pre_edit_status = self
            .pre_edit_status
            .as_deref()
            .map(str::parse::<ScheduleStatus>)
            .transpose()
            .map_err(|e| invalid(format!("{e}")))?;

        Ok(ScheduleRow {
            id: self.id,
            status,
            created_by: self.created_by,
            participant_ids: self.participant_ids,
            editing_by: self.editing_by,
            editing_at: self.editing_at,
            editing_expires_at: self.editing_expires_at,
            pre_edit_status,
            lock_type,
            lock_reason: self.lock_reason,
            lock_end_time: self.lock_end_time,
        })
    }
}

/// DTO for creating a schedule slot.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSchedule {
    pub status: Option<ScheduleStatus>,
    pub created_by: Option<DbId>,
    #[serde(default)]
    pub participant_ids: Vec<DbId>,
}
