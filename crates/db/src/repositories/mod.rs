//! Repository layer.
//!
//! Repositories are zero-sized structs providing async methods that accept
//! `&PgPool` as the first argument. `PgScheduleStore` adapts them to the
//! `ScheduleStore` trait the lock protocol is written against.

pub mod schedule_repo;

pub use schedule_repo::{PgScheduleStore, ScheduleRepo};
