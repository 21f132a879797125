//! Counters and point-in-time snapshots of the pool.

use serde::Serialize;
use tokio::time::Instant;

use crate::dispatch::ListenerInfo;
use crate::ids::ConnectionId;
use crate::pool::{Connection, ConnectionClass};
use crate::registry::SubscriptionInfo;

/// Monotonic counters kept by the manager.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub reconnects: u64,
    pub errors: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub evictions: u64,
    pub events_received: u64,
    pub duplicate_events: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub subscriber_id: String,
    pub origin: String,
    pub class: ConnectionClass,
    pub active: bool,
    pub failed: bool,
    pub subscription_count: usize,
    pub age_secs: u64,
    pub idle_secs: u64,
}

impl ConnectionInfo {
    pub fn from_connection(conn: &Connection, now: Instant) -> Self {
        Self {
            id: conn.id,
            subscriber_id: conn.key.subscriber_id.clone(),
            origin: conn.key.origin.clone(),
            class: conn.key.class,
            active: conn.usage.active,
            failed: conn.failed,
            subscription_count: conn.usage.subscription_count,
            age_secs: now.saturating_duration_since(conn.usage.created_at).as_secs(),
            idle_secs: now.saturating_duration_since(conn.usage.last_used).as_secs(),
        }
    }
}

/// Snapshot returned by `RealtimeManager::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStats {
    pub enabled: bool,
    pub max_connections: usize,
    pub connections: usize,
    pub active_connections: usize,
    pub subscriptions: usize,
    pub listeners: usize,
    /// Event keys currently remembered for listener de-duplication.
    pub processed_events: usize,
    #[serde(flatten)]
    pub counters: Counters,
    pub connection_details: Vec<ConnectionInfo>,
    pub subscription_details: Vec<SubscriptionInfo>,
    pub listener_details: Vec<ListenerInfo>,
}

impl RealtimeStats {
    pub fn is_connected(&self) -> bool {
        self.connections > 0
    }
}
