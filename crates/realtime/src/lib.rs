//! Realtime subscription pool.
//!
//! [`RealtimeManager`](manager::RealtimeManager) multiplexes many "listen for
//! row changes" requests onto a bounded number of push channels opened
//! through a [`PushSource`](source::PushSource). It deduplicates identical
//! subscribe requests, fans each change out to the owning subscription and
//! to every matching listener, rebuilds failed subscriptions, and evicts
//! idle or overaged connections on a fixed tick.

pub mod cleanup;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod filter;
pub mod ids;
pub mod manager;
pub mod memory;
pub mod notice;
pub mod pg_source;
pub mod pool;
pub mod reconnect;
pub mod registry;
pub mod source;
pub mod stats;

pub use config::RealtimeConfig;
pub use dispatch::{callback, CallbackError, ChangeCallback};
pub use error::RealtimeError;
pub use event::{ChangeEvent, ChangeKind, EventFilter};
pub use ids::{ConnectionId, ListenerId, SubscriptionId};
pub use manager::RealtimeManager;
pub use pool::ConnectionClass;
pub use registry::SubscribeRequest;
