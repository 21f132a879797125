//! Schedule-slot lock model: statuses, hold types, read-time expiry, and
//! edit-permission rules.
//!
//! There is no server-side lock primitive. A slot's lock *is* its row:
//! `status = editing` plus `editing_by` / `editing_expires_at` form a lease,
//! and `status = locked` plus `lock_type` / `lock_reason` form an
//! administrative hold. Every reader applies read-time expiry, so a lease
//! whose deadline has passed is treated as free even if the holder's process
//! died before it could release.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Table holding the bookable live-stream slots.
pub const SCHEDULES_TABLE: &str = "live_stream_schedules";

/// Default lease length (5 minutes).
pub const DEFAULT_LEASE_SECS: u64 = 300;

/// How often held leases are refreshed (1 minute).
pub const DEFAULT_EXTEND_INTERVAL_SECS: u64 = 60;

/// How often the polling fallback re-fetches the board (5 seconds).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Lease bounds accepted from configuration.
pub const MIN_LEASE_SECS: u64 = 10;
pub const MAX_LEASE_SECS: u64 = 4 * 3600;

// ---------------------------------------------------------------------------
// ScheduleStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a schedule slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Available,
    Editing,
    Booked,
    Completed,
    Cancelled,
    Locked,
}

impl ScheduleStatus {
    pub const ALL: [ScheduleStatus; 6] = [
        ScheduleStatus::Available,
        ScheduleStatus::Editing,
        ScheduleStatus::Booked,
        ScheduleStatus::Completed,
        ScheduleStatus::Cancelled,
        ScheduleStatus::Locked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Available => "available",
            ScheduleStatus::Editing => "editing",
            ScheduleStatus::Booked => "booked",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Cancelled => "cancelled",
            ScheduleStatus::Locked => "locked",
        }
    }

    /// Statuses a release may leave the slot in.
    pub fn is_valid_release_target(&self) -> bool {
        matches!(self, ScheduleStatus::Available | ScheduleStatus::Booked)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScheduleStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown schedule status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// HoldType
// ---------------------------------------------------------------------------

/// Kind of administrative hold placed on a slot (`lock_type` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldType {
    #[default]
    None,
    Manual,
    System,
    Maintenance,
}

impl HoldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldType::None => "none",
            HoldType::Manual => "manual",
            HoldType::System => "system",
            HoldType::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for HoldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HoldType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(HoldType::None),
            "manual" => Ok(HoldType::Manual),
            "system" => Ok(HoldType::System),
            "maintenance" => Ok(HoldType::Maintenance),
            other => Err(CoreError::Validation(format!("Unknown lock type '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleRow
// ---------------------------------------------------------------------------

/// The lock-relevant projection of a `live_stream_schedules` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub id: DbId,
    pub status: ScheduleStatus,
    pub created_by: Option<DbId>,
    #[serde(default)]
    pub participant_ids: Vec<DbId>,
    pub editing_by: Option<DbId>,
    pub editing_at: Option<Timestamp>,
    pub editing_expires_at: Option<Timestamp>,
    /// Status the row had when the current lease began. Only `booked`
    /// changes how the row reads once the lease lapses.
    #[serde(default)]
    pub pre_edit_status: Option<ScheduleStatus>,
    #[serde(default)]
    pub lock_type: HoldType,
    pub lock_reason: Option<String>,
    pub lock_end_time: Option<Timestamp>,
}

/// A live edit lease as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub resource_id: DbId,
    pub holder: DbId,
    pub acquired_at: Option<Timestamp>,
    pub expires_at: Timestamp,
}

/// An administrative hold as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldInfo {
    pub resource_id: DbId,
    pub lock_type: HoldType,
    pub reason: Option<String>,
    pub end_time: Option<Timestamp>,
}

impl ScheduleRow {
    /// A fresh, unclaimed slot.
    pub fn available(id: DbId) -> Self {
        Self {
            id,
            status: ScheduleStatus::Available,
            created_by: None,
            participant_ids: Vec::new(),
            editing_by: None,
            editing_at: None,
            editing_expires_at: None,
            pre_edit_status: None,
            lock_type: HoldType::None,
            lock_reason: None,
            lock_end_time: None,
        }
    }

    /// `true` if the row carries an edit lease that has not yet lapsed.
    ///
    /// An `editing` row missing either lease column has no live lease.
    pub fn has_live_lease(&self, now: Timestamp) -> bool {
        self.status == ScheduleStatus::Editing
            && self.editing_by.is_some()
            && self.editing_expires_at.is_some_and(|deadline| deadline > now)
    }

    /// `true` if the row is `editing` but its lease has lapsed or is malformed.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.status == ScheduleStatus::Editing && !self.has_live_lease(now)
    }

    /// Status after read-time expiry: a stale `editing` row reads as
    /// `booked` if it was booked before the lease began, else `available`.
    pub fn effective_status(&self, now: Timestamp) -> ScheduleStatus {
        if !self.is_stale(now) {
            self.status
        } else if self.was_booked() {
            ScheduleStatus::Booked
        } else {
            ScheduleStatus::Available
        }
    }

    /// `true` if the row is booked, or is being edited on top of a booking.
    pub fn was_booked(&self) -> bool {
        self.status == ScheduleStatus::Booked || self.pre_edit_status == Some(ScheduleStatus::Booked)
    }

    /// The holder of a live lease, if any.
    pub fn live_holder(&self, now: Timestamp) -> Option<DbId> {
        if self.has_live_lease(now) {
            self.editing_by
        } else {
            None
        }
    }

    /// `true` if someone other than `me` holds a live lease.
    pub fn is_locked_by_other(&self, me: DbId, now: Timestamp) -> bool {
        self.live_holder(now).is_some_and(|holder| holder != me)
    }

    pub fn lock_info(&self, now: Timestamp) -> Option<LockInfo> {
        let holder = self.live_holder(now)?;
        Some(LockInfo {
            resource_id: self.id,
            holder,
            acquired_at: self.editing_at,
            expires_at: self.editing_expires_at?,
        })
    }

    pub fn hold_info(&self) -> Option<HoldInfo> {
        if self.status != ScheduleStatus::Locked {
            return None;
        }
        Some(HoldInfo {
            resource_id: self.id,
            lock_type: self.lock_type,
            reason: self.lock_reason.clone(),
            end_time: self.lock_end_time,
        })
    }

    /// `status = editing` iff both `editing_by` and `editing_expires_at` are set.
    pub fn check_lease_columns(&self) -> Result<(), CoreError> {
        let has_columns = self.editing_by.is_some() && self.editing_expires_at.is_some();
        match (self.status == ScheduleStatus::Editing, has_columns) {
            (true, false) => Err(CoreError::Validation(format!(
                "Schedule {} is editing without a complete lease",
                self.id
            ))),
            (false, true) => Err(CoreError::Validation(format!(
                "Schedule {} carries a lease while '{}'",
                self.id, self.status
            ))),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Edit permission
// ---------------------------------------------------------------------------

/// Outcome of the "may I edit this slot" check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EditPermission {
    Allowed,
    Denied { reason: String },
}

impl EditPermission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, EditPermission::Allowed)
    }
}

/// Decide whether `me` may open the edit form for a slot.
///
/// `row` is `None` for an empty grid cell that has no schedule yet.
pub fn check_edit_permission(row: Option<&ScheduleRow>, me: DbId, now: Timestamp) -> EditPermission {
    let Some(row) = row else {
        return EditPermission::Allowed;
    };

    match row.effective_status(now) {
        ScheduleStatus::Available => EditPermission::Allowed,
        ScheduleStatus::Editing => match row.editing_by {
            // A lease without a holder is treated as unset.
            None => EditPermission::Allowed,
            Some(holder) if holder == me => EditPermission::Allowed,
            Some(holder) => EditPermission::Denied {
                reason: format!(
                    "Slot {} is being edited by user {holder}, please try again later",
                    row.id
                ),
            },
        },
        ScheduleStatus::Booked => {
            let is_creator = row.created_by == Some(me);
            let is_participant = row.participant_ids.contains(&me);
            if is_creator || is_participant {
                EditPermission::Allowed
            } else {
                EditPermission::Denied {
                    reason: "Only the creator or a registered participant may edit a booked slot"
                        .to_string(),
                }
            }
        }
        ScheduleStatus::Locked => EditPermission::Denied {
            reason: match &row.lock_reason {
                Some(reason) => format!("Slot {} is locked: {reason}", row.id),
                None => format!("Slot {} is locked ({})", row.id, row.lock_type),
            },
        },
        other => EditPermission::Denied {
            reason: format!("Slot status '{other}' does not allow editing"),
        },
    }
}

/// Validate a configured lease length in seconds.
pub fn validate_lease_secs(secs: u64) -> Result<(), CoreError> {
    if secs < MIN_LEASE_SECS {
        return Err(CoreError::Validation(format!(
            "Lease must be at least {MIN_LEASE_SECS} seconds, got {secs}"
        )));
    }
    if secs > MAX_LEASE_SECS {
        return Err(CoreError::Validation(format!(
            "Lease must be at most {MAX_LEASE_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn editing_row(holder: DbId, expires_at: Timestamp) -> ScheduleRow {
        ScheduleRow {
            status: ScheduleStatus::Editing,
            editing_by: Some(holder),
            editing_at: Some(expires_at - Duration::minutes(5)),
            editing_expires_at: Some(expires_at),
            ..ScheduleRow::available(7)
        }
    }

    // -- status parsing -------------------------------------------------------

    #[test]
    fn status_round_trips_through_str() {
        for status in ScheduleStatus::ALL {
            assert_eq!(status.as_str().parse::<ScheduleStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_rejected() {
        assert!("EDITING".parse::<ScheduleStatus>().is_err());
        assert!("".parse::<ScheduleStatus>().is_err());
    }

    #[test]
    fn hold_type_parses_known_values() {
        assert_eq!("maintenance".parse::<HoldType>().unwrap(), HoldType::Maintenance);
        assert!("time_slot".parse::<HoldType>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ScheduleStatus::Editing).unwrap();
        assert_eq!(json, r#""editing""#);
    }

    // -- read-time expiry -----------------------------------------------------

    #[test]
    fn live_lease_reads_as_editing() {
        let row = editing_row(1, t0() + Duration::minutes(3));
        assert!(row.has_live_lease(t0()));
        assert_eq!(row.effective_status(t0()), ScheduleStatus::Editing);
        assert_eq!(row.live_holder(t0()), Some(1));
    }

    #[test]
    fn lapsed_lease_reads_as_available() {
        let row = editing_row(1, t0() - Duration::seconds(1));
        assert!(row.is_stale(t0()));
        assert_eq!(row.effective_status(t0()), ScheduleStatus::Available);
        assert_eq!(row.live_holder(t0()), None);
        assert!(row.lock_info(t0()).is_none());
    }

    #[test]
    fn lapsed_lease_over_booking_reads_as_booked() {
        let row = ScheduleRow {
            pre_edit_status: Some(ScheduleStatus::Booked),
            created_by: Some(10),
            ..editing_row(1, t0() - Duration::seconds(1))
        };
        assert_eq!(row.effective_status(t0()), ScheduleStatus::Booked);
        assert!(check_edit_permission(Some(&row), 10, t0()).is_allowed());
        assert!(!check_edit_permission(Some(&row), 13, t0()).is_allowed());
    }

    #[test]
    fn deadline_equal_to_now_is_expired() {
        let row = editing_row(1, t0());
        assert!(!row.has_live_lease(t0()));
    }

    #[test]
    fn editing_without_deadline_is_stale() {
        let row = ScheduleRow {
            editing_expires_at: None,
            ..editing_row(1, t0())
        };
        assert!(row.is_stale(t0()));
        assert!(row.check_lease_columns().is_err());
    }

    #[test]
    fn locked_by_other_ignores_own_lease() {
        let row = editing_row(1, t0() + Duration::minutes(1));
        assert!(!row.is_locked_by_other(1, t0()));
        assert!(row.is_locked_by_other(2, t0()));
        assert!(!row.is_locked_by_other(2, t0() + Duration::minutes(2)));
    }

    #[test]
    fn lease_columns_on_available_row_flagged() {
        let row = ScheduleRow {
            status: ScheduleStatus::Available,
            ..editing_row(1, t0())
        };
        assert!(row.check_lease_columns().is_err());
        assert!(ScheduleRow::available(1).check_lease_columns().is_ok());
    }

    #[test]
    fn hold_info_only_for_locked_rows() {
        let mut row = ScheduleRow::available(3);
        assert!(row.hold_info().is_none());
        row.status = ScheduleStatus::Locked;
        row.lock_type = HoldType::Maintenance;
        row.lock_reason = Some("camera service".into());
        let info = row.hold_info().unwrap();
        assert_eq!(info.lock_type, HoldType::Maintenance);
        assert_eq!(info.reason.as_deref(), Some("camera service"));
    }

    // -- edit permission ------------------------------------------------------

    #[test]
    fn empty_cell_is_editable() {
        assert!(check_edit_permission(None, 1, t0()).is_allowed());
    }

    #[test]
    fn available_is_editable_by_anyone() {
        let row = ScheduleRow::available(1);
        assert!(check_edit_permission(Some(&row), 99, t0()).is_allowed());
    }

    #[test]
    fn editing_allowed_for_holder_only() {
        let row = editing_row(5, t0() + Duration::minutes(2));
        assert!(check_edit_permission(Some(&row), 5, t0()).is_allowed());

        let denied = check_edit_permission(Some(&row), 6, t0());
        match denied {
            EditPermission::Denied { reason } => assert!(reason.contains("user 5")),
            EditPermission::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn editing_allowed_for_anyone_once_expired() {
        let row = editing_row(5, t0() - Duration::seconds(30));
        assert!(check_edit_permission(Some(&row), 6, t0()).is_allowed());
    }

    #[test]
    fn booked_allowed_for_creator_and_participants() {
        let row = ScheduleRow {
            status: ScheduleStatus::Booked,
            created_by: Some(10),
            participant_ids: vec![11, 12],
            ..ScheduleRow::available(4)
        };
        assert!(check_edit_permission(Some(&row), 10, t0()).is_allowed());
        assert!(check_edit_permission(Some(&row), 12, t0()).is_allowed());
        assert!(!check_edit_permission(Some(&row), 13, t0()).is_allowed());
    }

    #[test]
    fn locked_and_terminal_statuses_denied() {
        let mut row = ScheduleRow::available(4);
        for status in [
            ScheduleStatus::Locked,
            ScheduleStatus::Completed,
            ScheduleStatus::Cancelled,
        ] {
            row.status = status;
            assert!(!check_edit_permission(Some(&row), 1, t0()).is_allowed());
        }
    }

    // -- lease validation -----------------------------------------------------

    #[test]
    fn default_lease_in_valid_range() {
        assert!(validate_lease_secs(DEFAULT_LEASE_SECS).is_ok());
        assert!(validate_lease_secs(1).is_err());
        assert!(validate_lease_secs(MAX_LEASE_SECS + 1).is_err());
    }
}
