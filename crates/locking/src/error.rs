use realtyops_core::error::CoreError;
use realtyops_core::schedule::{HoldType, ScheduleStatus};
use realtyops_core::store::StoreError;
use realtyops_core::types::{DbId, Timestamp};
use realtyops_realtime::RealtimeError;

/// Errors surfaced by the edit-lock protocol.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another operator holds a live lease.
    #[error("Schedule {resource_id} is being edited by user {held_by} until {expires_at}")]
    AlreadyLocked {
        resource_id: DbId,
        held_by: DbId,
        expires_at: Timestamp,
    },

    /// The slot is under an administrative hold.
    #[error("Schedule {resource_id} is held ({lock_type}){}", reason_suffix(.reason))]
    Held {
        resource_id: DbId,
        lock_type: HoldType,
        reason: Option<String>,
    },

    /// The slot's status does not allow the operation.
    #[error("Schedule {resource_id} is '{status}'")]
    NotEditable {
        resource_id: DbId,
        status: ScheduleStatus,
    },

    /// Edit permission rules reject the caller.
    #[error("{0}")]
    Denied(String),

    /// The caller does not hold the lease.
    #[error("User {holder} does not hold the lease on schedule {resource_id}")]
    NotHolder { resource_id: DbId, holder: DbId },

    #[error("Schedule {0} not found")]
    NotFound(DbId),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error("Lock manager is shut down")]
    ShutDown,
}

impl From<LockError> for CoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked { .. } | LockError::Held { .. } | LockError::NotEditable { .. } => {
                CoreError::Conflict(err.to_string())
            }
            LockError::Denied(reason) => CoreError::Forbidden(reason),
            LockError::NotHolder { .. } => CoreError::Forbidden(err.to_string()),
            LockError::NotFound(id) => CoreError::NotFound {
                entity: "Schedule",
                id,
            },
            LockError::Invalid(msg) => CoreError::Validation(msg),
            LockError::Store(StoreError::NotFound(id)) => CoreError::NotFound {
                entity: "Schedule",
                id,
            },
            LockError::Store(e) => CoreError::Internal(e.to_string()),
            LockError::Realtime(e) => e.into(),
            LockError::ShutDown => CoreError::Unavailable(err.to_string()),
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn held_message_includes_reason() {
        let err = LockError::Held {
            resource_id: 4,
            lock_type: HoldType::Maintenance,
            reason: Some("studio repair".into()),
        };
        assert_eq!(err.to_string(), "Schedule 4 is held (maintenance): studio repair");
    }

    #[test]
    fn contention_maps_to_conflict() {
        let err = LockError::AlreadyLocked {
            resource_id: 1,
            held_by: 2,
            expires_at: chrono::Utc::now(),
        };
        assert_matches!(CoreError::from(err), CoreError::Conflict(_));
    }

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err = LockError::Store(StoreError::NotFound(9));
        assert_matches!(CoreError::from(err), CoreError::NotFound { id: 9, .. });
    }
}
