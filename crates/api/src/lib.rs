//! HTTP surface of the schedule board's lock and realtime services.
//!
//! Exposes config, state, error handling, and routes so integration tests
//! and the binary entrypoint share them.

pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
