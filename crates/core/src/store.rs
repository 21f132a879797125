//! Resource Store contract: conditional row updates and point lookups.
//!
//! The lock protocol is expressed entirely as guarded updates against this
//! trait. A guard that does not match leaves the row untouched and reports
//! `matched == 0`, which is how contention is detected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::schedule::{HoldType, ScheduleRow, ScheduleStatus};
use crate::types::{DbId, Timestamp};

/// Failure reported by a Resource Store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Schedule {0} not found")]
    NotFound(DbId),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Invalid row {id}: {reason}")]
    InvalidRow { id: DbId, reason: String },
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Precondition a row must satisfy for an update to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// `available` or `booked`, or `editing` without a live lease at `now`.
    Claimable { now: Timestamp },
    /// `editing_by = holder`.
    HeldBy(DbId),
    /// Not under a live edit lease at `now`, and neither `booked` nor
    /// edited on top of a booking.
    Holdable { now: Timestamp },
    /// `status = s`.
    Status(ScheduleStatus),
    Always,
}

impl Guard {
    pub fn matches(&self, row: &ScheduleRow) -> bool {
        match self {
            Guard::Claimable { now } => match row.status {
                ScheduleStatus::Available | ScheduleStatus::Booked => true,
                ScheduleStatus::Editing => !row.has_live_lease(*now),
                _ => false,
            },
            Guard::HeldBy(holder) => row.editing_by == Some(*holder),
            Guard::Holdable { now } => !row.was_booked() && !row.has_live_lease(*now),
            Guard::Status(status) => row.status == *status,
            Guard::Always => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Set(ScheduleStatus),
    /// Set `available` unless the row is `booked` or was `booked` when the
    /// current lease began.
    ResetUnlessBooked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditingChange {
    Begin {
        holder: DbId,
        at: Timestamp,
        expires_at: Timestamp,
    },
    ExtendTo(Timestamp),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldChange {
    Place {
        lock_type: HoldType,
        reason: Option<String>,
        end_time: Option<Timestamp>,
    },
    Lift,
}

/// Column changes applied by a conditional update. `None` fields are left as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulePatch {
    pub status: Option<StatusChange>,
    pub editing: Option<EditingChange>,
    pub hold: Option<HoldChange>,
}

impl SchedulePatch {
    pub fn begin_editing(holder: DbId, at: Timestamp, expires_at: Timestamp) -> Self {
        Self {
            status: Some(StatusChange::Set(ScheduleStatus::Editing)),
            editing: Some(EditingChange::Begin {
                holder,
                at,
                expires_at,
            }),
            hold: None,
        }
    }

    pub fn extend_lease(expires_at: Timestamp) -> Self {
        Self {
            editing: Some(EditingChange::ExtendTo(expires_at)),
            ..Self::default()
        }
    }

    /// Clear the lease. With no explicit final status the row returns to
    /// `available`, except that a `booked` row stays `booked`.
    pub fn end_editing(final_status: Option<ScheduleStatus>) -> Self {
        let status = match final_status {
            Some(status) => StatusChange::Set(status),
            None => StatusChange::ResetUnlessBooked,
        };
        Self {
            status: Some(status),
            editing: Some(EditingChange::Clear),
            hold: None,
        }
    }

    pub fn place_hold(lock_type: HoldType, reason: Option<String>, end_time: Option<Timestamp>) -> Self {
        Self {
            status: Some(StatusChange::Set(ScheduleStatus::Locked)),
            editing: Some(EditingChange::Clear),
            hold: Some(HoldChange::Place {
                lock_type,
                reason,
                end_time,
            }),
        }
    }

    pub fn lift_hold() -> Self {
        Self {
            status: Some(StatusChange::Set(ScheduleStatus::Available)),
            editing: None,
            hold: Some(HoldChange::Lift),
        }
    }

    /// Apply the patch to an in-memory row, mirroring the SQL the Postgres
    /// store issues.
    pub fn apply_to(&self, row: &mut ScheduleRow) {
        let prior_status = row.status;
        match &self.status {
            Some(StatusChange::Set(status)) => row.status = *status,
            Some(StatusChange::ResetUnlessBooked) => {
                row.status = if row.was_booked() {
                    ScheduleStatus::Booked
                } else {
                    ScheduleStatus::Available
                };
            }
            None => {}
        }

        match &self.editing {
            Some(EditingChange::Begin {
                holder,
                at,
                expires_at,
            }) => {
                // A stale lease being taken over keeps the status it replaced.
                if prior_status != ScheduleStatus::Editing {
                    row.pre_edit_status = Some(prior_status);
                }
                row.editing_by = Some(*holder);
                row.editing_at = Some(*at);
                row.editing_expires_at = Some(*expires_at);
            }
            Some(EditingChange::ExtendTo(expires_at)) => {
                row.editing_expires_at = Some(*expires_at);
            }
            Some(EditingChange::Clear) => {
                row.editing_by = None;
                row.editing_at = None;
                row.editing_expires_at = None;
                row.pre_edit_status = None;
            }
            None => {}
        }

        match &self.hold {
            Some(HoldChange::Place {
                lock_type,
                reason,
                end_time,
            }) => {
                row.lock_type = *lock_type;
                row.lock_reason = reason.clone();
                row.lock_end_time = *end_time;
            }
            Some(HoldChange::Lift) => {
                row.lock_type = HoldType::None;
                row.lock_reason = None;
                row.lock_end_time = None;
            }
            None => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Results and queries
// ---------------------------------------------------------------------------

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub row: Option<ScheduleRow>,
}

impl UpdateOutcome {
    pub fn unmatched() -> Self {
        Self {
            matched: 0,
            row: None,
        }
    }

    pub fn applied(row: ScheduleRow) -> Self {
        Self {
            matched: 1,
            row: Some(row),
        }
    }

    pub fn is_applied(&self) -> bool {
        self.matched > 0
    }
}

/// Row selection. Empty lists mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleQuery {
    #[serde(default)]
    pub statuses: Vec<ScheduleStatus>,
    #[serde(default)]
    pub ids: Vec<DbId>,
}

impl ScheduleQuery {
    /// Rows that can carry lock state: editing, available, booked, locked.
    pub fn lock_candidates() -> Self {
        Self {
            statuses: vec![
                ScheduleStatus::Editing,
                ScheduleStatus::Available,
                ScheduleStatus::Booked,
                ScheduleStatus::Locked,
            ],
            ids: Vec::new(),
        }
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = DbId>) -> Self {
        self.ids = ids.into_iter().collect();
        self
    }

    pub fn matches(&self, row: &ScheduleRow) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&row.status))
            && (self.ids.is_empty() || self.ids.contains(&row.id))
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Durable row storage with conditional update and point lookups.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// Apply `patch` to row `id` only if `guard` holds, atomically.
    async fn update_where(
        &self,
        id: DbId,
        patch: &SchedulePatch,
        guard: &Guard,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn select_where(&self, query: &ScheduleQuery) -> Result<Vec<ScheduleRow>, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<ScheduleRow>, StoreError>;
}
