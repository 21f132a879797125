//! Connection records, reuse lookup, and the eviction policy.
//!
//! The pool itself performs no I/O. The manager opens and closes channels
//! and keeps this structure consistent with what is actually open.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RealtimeConfig;
use crate::ids::ConnectionId;
use crate::source::PushChannel;

// ---------------------------------------------------------------------------
// ConnectionClass
// ---------------------------------------------------------------------------

/// Lifetime class of a connection, chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionClass {
    /// Tied to a visible page; short idle and age limits, paused when hidden.
    #[default]
    Page,
    /// Background consumers such as the lock observer.
    LongTerm,
}

impl ConnectionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionClass::Page => "page",
            ConnectionClass::LongTerm => "long-term",
        }
    }
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Structural identity used for connection reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub subscriber_id: String,
    pub origin: String,
    pub class: ConnectionClass,
}

impl PoolKey {
    /// Name of the push channel opened for this key. `seq` keeps names unique
    /// when a key is reopened after eviction.
    pub fn channel_name(&self, seq: &ConnectionId) -> String {
        format!("realtime:{}:{}:{}:{}", self.class, self.origin, self.subscriber_id, seq)
    }
}

/// Timestamps and counters that drive eviction.
#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub created_at: Instant,
    pub last_used: Instant,
    /// `false` while paused.
    pub active: bool,
    pub subscription_count: usize,
}

impl Usage {
    pub fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            last_used: now,
            active: true,
            subscription_count: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_used = now;
    }
}

/// An open push channel and its bookkeeping.
pub struct Connection {
    pub id: ConnectionId,
    pub key: PoolKey,
    pub usage: Usage,
    /// Set on a channel-wide failure; a failed connection takes no new
    /// subscriptions.
    pub failed: bool,
    pub(crate) channel: Arc<dyn PushChannel>,
    /// Cancels the pump task that drains the channel's message stream.
    pub(crate) pump_cancel: CancellationToken,
    pub(crate) pump: Option<JoinHandle<()>>,
}


// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Idle,
    MaxAge,
    Empty,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EvictionReason::Idle => "idle",
            EvictionReason::MaxAge => "max_age",
            EvictionReason::Empty => "empty",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    pub page_idle_timeout: Duration,
    pub page_max_age: Duration,
    pub long_term_idle_timeout: Duration,
    pub long_term_max_age: Duration,
    pub empty_grace: Duration,
}

impl From<&RealtimeConfig> for EvictionPolicy {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            page_idle_timeout: config.page_idle_timeout,
            page_max_age: config.page_max_age,
            long_term_idle_timeout: config.long_term_idle_timeout,
            long_term_max_age: config.long_term_max_age,
            empty_grace: config.empty_grace,
        }
    }
}

impl EvictionPolicy {
    pub fn idle_timeout(&self, class: ConnectionClass) -> Duration {
        match class {
            ConnectionClass::Page => self.page_idle_timeout,
            ConnectionClass::LongTerm => self.long_term_idle_timeout,
        }
    }

    pub fn max_age(&self, class: ConnectionClass) -> Duration {
        match class {
            ConnectionClass::Page => self.page_max_age,
            ConnectionClass::LongTerm => self.long_term_max_age,
        }
    }

    /// Decide whether a connection should be closed at `now`.
    ///
    /// Paused connections are exempt from the class idle limit; age and
    /// the empty-connection grace still apply.
    pub fn evaluate(&self, class: ConnectionClass, usage: &Usage, now: Instant) -> Option<EvictionReason> {
        let age = now.saturating_duration_since(usage.created_at);
        let idle = now.saturating_duration_since(usage.last_used);

        if age > self.max_age(class) {
            return Some(EvictionReason::MaxAge);
        }
        if usage.active && idle > self.idle_timeout(class) {
            return Some(EvictionReason::Idle);
        }
        if usage.subscription_count == 0 && idle > self.empty_grace {
            return Some(EvictionReason::Empty);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

/// Bounded set of open connections.
pub struct ConnectionPool {
    connections: HashMap<ConnectionId, Connection>,
    max_connections: usize,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn has_capacity(&self) -> bool {
        self.connections.len() < self.max_connections
    }

    /// An active, healthy connection with the same key.
    pub fn find_reusable(&self, key: &PoolKey) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|c| c.usage.active && !c.failed && c.key == *key)
            .map(|c| c.id)
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.id, connection);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.connections.values().filter(|c| c.usage.active).count()
    }

    /// Connections the policy would close at `now`.
    pub fn evictable(&self, policy: &EvictionPolicy, now: Instant) -> Vec<(ConnectionId, EvictionReason)> {
        self.connections
            .values()
            .filter_map(|c| policy.evaluate(c.key.class, &c.usage, now).map(|r| (c.id, r)))
            .collect()
    }

    pub fn ids_where(&self, pred: impl Fn(&Connection) -> bool) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| pred(c))
            .map(|c| c.id)
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> EvictionPolicy {
        EvictionPolicy::from(&RealtimeConfig::default())
    }

    fn usage_at(now: Instant, subs: usize) -> Usage {
        Usage {
            subscription_count: subs,
            ..Usage::new(now)
        }
    }

    // -- page class -----------------------------------------------------------

    #[test]
    fn fresh_page_connection_is_kept() {
        let now = Instant::now();
        assert_eq!(policy().evaluate(ConnectionClass::Page, &usage_at(now, 1), now), None);
    }

    #[test]
    fn page_idle_over_limit_is_evicted() {
        let start = Instant::now();
        let later = start + Duration::from_secs(61);
        assert_eq!(
            policy().evaluate(ConnectionClass::Page, &usage_at(start, 1), later),
            Some(EvictionReason::Idle)
        );
    }

    #[test]
    fn page_over_max_age_is_evicted_even_if_busy() {
        let start = Instant::now();
        let later = start + Duration::from_secs(301);
        let mut usage = usage_at(start, 3);
        usage.touch(later);
        assert_eq!(
            policy().evaluate(ConnectionClass::Page, &usage, later),
            Some(EvictionReason::MaxAge)
        );
    }

    #[test]
    fn paused_connection_is_exempt_from_idle() {
        let start = Instant::now();
        let later = start + Duration::from_secs(120);
        let mut usage = usage_at(start, 1);
        usage.active = false;
        assert_eq!(policy().evaluate(ConnectionClass::Page, &usage, later), None);

        let much_later = start + Duration::from_secs(301);
        assert_eq!(
            policy().evaluate(ConnectionClass::Page, &usage, much_later),
            Some(EvictionReason::MaxAge)
        );
    }

    // -- long-term class ------------------------------------------------------

    #[test]
    fn long_term_survives_page_idle_limit() {
        let start = Instant::now();
        let later = start + Duration::from_secs(10 * 60);
        assert_eq!(policy().evaluate(ConnectionClass::LongTerm, &usage_at(start, 1), later), None);
    }

    #[test]
    fn long_term_idle_over_limit_is_evicted() {
        let start = Instant::now();
        let later = start + Duration::from_secs(31 * 60);
        assert_eq!(
            policy().evaluate(ConnectionClass::LongTerm, &usage_at(start, 1), later),
            Some(EvictionReason::Idle)
        );
    }

    #[test]
    fn empty_connection_evicted_after_grace() {
        let start = Instant::now();
        let later = start + Duration::from_secs(61);
        assert_eq!(
            policy().evaluate(ConnectionClass::LongTerm, &usage_at(start, 0), later),
            Some(EvictionReason::Empty)
        );
        let within = start + Duration::from_secs(30);
        assert_eq!(policy().evaluate(ConnectionClass::LongTerm, &usage_at(start, 0), within), None);
    }

    #[test]
    fn class_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionClass::LongTerm).unwrap(),
            r#""long-term""#
        );
    }
}
