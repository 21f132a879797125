//! Shared domain types for the scheduling board's realtime and locking layers.
//!
//! This crate has zero internal dependencies so that the Postgres store, the
//! realtime pool, the lock protocol, and the HTTP layer can all agree on one
//! definition of a schedule slot and of who may edit it.

pub mod clock;
pub mod env;
pub mod error;
pub mod schedule;
pub mod store;
pub mod types;
