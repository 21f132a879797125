use crate::types::DbId;

/// Domain-level errors shared across crates.
///
/// The HTTP layer maps each variant onto a status code; library crates
/// with richer failure modes (store, realtime, locking) define their own
/// enums and convert into this one only at the edge.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Another operator holds the resource.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A dependency (push source, pool) cannot serve the request right now.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
