/// Schedule slots and user profiles are keyed by PostgreSQL BIGSERIAL ids.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
