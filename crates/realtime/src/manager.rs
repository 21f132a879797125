//! The realtime subscription pool.
//!
//! [`RealtimeManager`] owns every open push channel, every subscription, and
//! every listener. It is a cheap handle over shared state: clone it into
//! request handlers and background tasks.
//!
//! Two locks guard the state:
//!
//! - an async *mutation gate* serializes subscribe, reconnect, and cleanup,
//!   and is held across channel I/O so that capacity checks and channel
//!   opening cannot interleave;
//! - a short-held `std::sync::Mutex` protects the pool, registry, and
//!   listener tables, and is never held across an `.await`.
//!
//! Each connection has one pump task that drains its message stream in
//! arrival order and only ever takes the state mutex, so dispatch never
//! waits behind channel opening or teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RealtimeConfig;
use crate::dispatch::{invoke, ChangeCallback, ListenerRegistry, RecentKeys};
use crate::error::RealtimeError;
use crate::event::{ChangeEvent, EventFilter};
use crate::ids::{ConnectionId, ListenerId, SubscriptionId};
use crate::notice::{NoticeBus, RealtimeNotice};
use crate::pool::{Connection, ConnectionClass, ConnectionPool, EvictionPolicy, EvictionReason, PoolKey, Usage};
use crate::registry::{
    DuplicateGroup, Registry, SubscribeRequest, SubscriptionInfo, SubscriptionRecord, SubscriptionState,
};
use crate::source::{Binding, ChannelMessage, ChannelStatus, MessageStream, PushChannel, PushSource};
use crate::stats::{ConnectionInfo, Counters, RealtimeStats};
use crate::{cleanup, reconnect};

/// How long shutdown waits for each background task.
const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct State {
    pool: ConnectionPool,
    registry: Registry,
    listeners: ListenerRegistry,
    recent: RecentKeys,
    counters: Counters,
}

impl State {
    /// Remove a subscription and release its connection slot.
    fn detach(&mut self, id: SubscriptionId, now: Instant) -> Option<Detached> {
        let record = self.registry.remove(id)?;
        let mut detached = Detached {
            id,
            channel: None,
            closed: None,
        };

        if let Some(conn) = self.pool.get_mut(record.connection_id) {
            conn.usage.subscription_count = conn.usage.subscription_count.saturating_sub(1);
            conn.usage.touch(now);
            if conn.usage.subscription_count == 0 {
                detached.closed = self.pool.remove(record.connection_id);
            } else {
                detached.channel = Some(Arc::clone(&conn.channel));
            }
        }
        Some(detached)
    }
}

/// Channel work left over after a subscription was removed from the state.
struct Detached {
    id: SubscriptionId,
    channel: Option<Arc<dyn PushChannel>>,
    closed: Option<Connection>,
}

impl Detached {
    async fn finish(self) {
        match (self.closed, self.channel) {
            (Some(conn), _) => close_connection(conn).await,
            (None, Some(channel)) => channel.off(self.id).await,
            (None, None) => {}
        }
    }
}

async fn close_connection(mut conn: Connection) {
    conn.pump_cancel.cancel();
    conn.channel.close().await;
    conn.pump.take();
    tracing::debug!(connection_id = %conn.id, origin = %conn.key.origin, "Connection closed");
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub evicted: Vec<(ConnectionId, EvictionReason)>,
    pub removed_subscriptions: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.removed_subscriptions == 0
    }
}

// ---------------------------------------------------------------------------
// RealtimeManager
// ---------------------------------------------------------------------------

struct Inner {
    config: RealtimeConfig,
    policy: EvictionPolicy,
    source: Arc<dyn PushSource>,
    enabled: AtomicBool,
    started: AtomicBool,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    notices: NoticeBus,
    /// Master cancellation token; pumps and background tasks use children.
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded, de-duplicating pool of push subscriptions.
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<Inner>,
}

impl RealtimeManager {
    /// Build a manager. No background task runs until [`start`](Self::start).
    pub fn new(config: RealtimeConfig, source: Arc<dyn PushSource>) -> Self {
        let state = State {
            pool: ConnectionPool::new(config.max_connections),
            registry: Registry::new(),
            listeners: ListenerRegistry::new(),
            recent: RecentKeys::new(config.dedup_capacity),
            counters: Counters::default(),
        };
        Self {
            inner: Arc::new(Inner {
                policy: EvictionPolicy::from(&config),
                enabled: AtomicBool::new(config.enabled),
                config,
                source,
                started: AtomicBool::new(false),
                gate: tokio::sync::Mutex::new(()),
                state: Mutex::new(state),
                notices: NoticeBus::default(),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the cleanup scheduler. Calling this twice is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(cleanup::run(
            self.clone(),
            self.inner.config.cleanup_interval,
            self.inner.cancel.child_token(),
        ));
        self.track(handle);
        tracing::info!(
            max_connections = self.inner.config.max_connections,
            cleanup_interval_secs = self.inner.config.cleanup_interval.as_secs(),
            "Realtime manager started"
        );
    }

    /// Stop background tasks and close every channel.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down realtime manager");
        self.inner.cancel.cancel();

        let gate = tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, self.inner.gate.lock()).await;
        if gate.is_err() {
            tracing::warn!("Timed out waiting for in-flight subscribe; closing anyway");
        }

        let (connections, removed) = {
            let mut st = self.state();
            let removed: Vec<SubscriptionId> = st.registry.drain().into_iter().map(|s| s.id).collect();
            st.recent.clear();
            (st.pool.drain(), removed)
        };

        for mut conn in connections {
            conn.pump_cancel.cancel();
            conn.channel.close().await;
            if let Some(pump) = conn.pump.take() {
                let _ = tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, pump).await;
            }
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks());
        for task in tasks {
            let _ = tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, task).await;
        }

        if !removed.is_empty() {
            self.publish(RealtimeNotice::Removed {
                subscription_ids: removed,
            });
        }
        self.publish_counts();
        tracing::info!("Realtime manager shut down complete");
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Subscribe to lifecycle notices.
    pub fn notices(&self) -> broadcast::Receiver<RealtimeNotice> {
        self.inner.notices.subscribe()
    }

    // ---- subscriptions ----

    /// Subscribe to changes described by `request`.
    ///
    /// An identical live subscription for the same subscriber (same table,
    /// event, filter, and origin) is reused: its id is returned and its
    /// callback is replaced by `callback`.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        request: SubscribeRequest,
        callback: ChangeCallback,
    ) -> Result<SubscriptionId, RealtimeError> {
        let _gate = self.inner.gate.lock().await;
        self.subscribe_locked(subscriber_id, request, callback).await
    }

    /// Remove a subscription. Unknown ids are a logged no-op.
    ///
    /// The subscription stops receiving changes as soon as this is called;
    /// the channel binding is removed afterwards.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let detached = self.state().detach(id, Instant::now());
        match detached {
            Some(detached) => {
                tracing::debug!(subscription_id = %id, "Unsubscribed");
                detached.finish().await;
                self.publish_counts();
            }
            None => {
                tracing::warn!(subscription_id = %id, "Unsubscribe for unknown subscription");
            }
        }
    }

    /// Remove every subscription owned by `subscriber_id`.
    pub async fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let ids = self.state().registry.ids_where(|s| s.subscriber_id == subscriber_id);
        self.remove_many(ids, "subscriber").await
    }

    /// Remove every subscription created with `origin`.
    pub async fn cleanup_by_origin(&self, origin: &str) -> usize {
        let ids = self.state().registry.ids_where(|s| s.request.origin == origin);
        self.remove_many(ids, "origin").await
    }

    /// Remove every subscription on a connection of `class`.
    pub async fn cleanup_by_class(&self, class: ConnectionClass) -> usize {
        let ids = self.state().registry.ids_where(|s| s.request.class == class);
        self.remove_many(ids, "class").await
    }

    /// Remove subscriptions created longer than `max_age` ago (default:
    /// `subscription_max_age` from the config).
    pub async fn cleanup_expired_subscriptions(&self, max_age: Option<Duration>) -> usize {
        let max_age = max_age.unwrap_or(self.inner.config.subscription_max_age);
        let now = Instant::now();
        let ids = self
            .state()
            .registry
            .ids_where(|s| now.saturating_duration_since(s.created_at) > max_age);
        self.remove_many(ids, "expired").await
    }

    /// Close every connection and drop every subscription. Listeners stay
    /// registered.
    pub async fn cleanup_all(&self) {
        let _gate = self.inner.gate.lock().await;
        let (connections, removed) = {
            let mut st = self.state();
            let removed: Vec<SubscriptionId> = st.registry.drain().into_iter().map(|s| s.id).collect();
            st.recent.clear();
            (st.pool.drain(), removed)
        };

        let closed = connections.len();
        for conn in connections {
            close_connection(conn).await;
        }

        tracing::info!(connections = closed, subscriptions = removed.len(), "Realtime state cleared");
        if !removed.is_empty() {
            self.publish(RealtimeNotice::Removed {
                subscription_ids: removed,
            });
        }
        self.publish_counts();
    }

    /// Switch realtime on or off. Disabling tears everything down.
    pub async fn set_enabled(&self, enabled: bool) {
        let was = self.inner.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            tracing::info!(enabled, "Realtime enabled flag changed");
        }
        if !enabled {
            self.cleanup_all().await;
        }
    }

    /// Live subscriptions that share a (table, event, filter) target.
    pub fn find_duplicate_subscriptions(&self) -> Vec<DuplicateGroup> {
        self.state().registry.duplicate_groups()
    }

    pub fn subscription_state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.state().registry.get(id).map(|s| s.state)
    }

    pub fn subscription_info(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        let now = Instant::now();
        self.state().registry.get(id).map(|s| s.info(now))
    }

    pub fn subscription_count(&self) -> usize {
        self.state().registry.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state().pool.len()
    }

    // ---- visibility ----

    /// Mark every `page` connection inactive (the page is hidden).
    pub fn pause_page_connections(&self) -> usize {
        self.set_page_active(false)
    }

    /// Mark every `page` connection active again.
    pub fn resume_page_connections(&self) -> usize {
        self.set_page_active(true)
    }

    fn set_page_active(&self, active: bool) -> usize {
        let now = Instant::now();
        let changed = {
            let mut st = self.state();
            let mut changed = 0;
            for conn in st.pool.iter_mut().filter(|c| c.key.class == ConnectionClass::Page) {
                conn.usage.active = active;
                conn.usage.touch(now);
                changed += 1;
            }
            changed
        };
        tracing::debug!(active, connections = changed, "Page connections visibility changed");
        self.publish_counts();
        changed
    }

    // ---- listeners ----

    /// Register a listener for every change to `table` matching `event`,
    /// whichever subscription delivers it.
    pub fn register_listener(
        &self,
        table: &str,
        event: EventFilter,
        origin: &str,
        callback: ChangeCallback,
    ) -> ListenerId {
        let (id, created) = self.state().listeners.register(table, event, origin, callback);
        if created {
            tracing::debug!(listener_id = %id, table, %event, origin, "Listener registered");
        }
        id
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.state().listeners.unregister(id)
    }

    pub fn cleanup_listeners_by_origin(&self, origin: &str) -> usize {
        self.state().listeners.remove_by_origin(origin)
    }

    /// Drop every listener and forget recently seen event keys.
    pub fn cleanup_all_listeners(&self) {
        let mut st = self.state();
        st.listeners.clear();
        st.recent.clear();
    }

    // ---- stats ----

    pub fn stats(&self) -> RealtimeStats {
        let now = Instant::now();
        let st = self.state();
        RealtimeStats {
            enabled: self.is_enabled(),
            max_connections: st.pool.max_connections(),
            connections: st.pool.len(),
            active_connections: st.pool.active_count(),
            subscriptions: st.registry.len(),
            listeners: st.listeners.len(),
            processed_events: st.recent.len(),
            counters: st.counters,
            connection_details: st
                .pool
                .iter()
                .map(|c| ConnectionInfo::from_connection(c, now))
                .collect(),
            subscription_details: st.registry.iter().map(|s| s.info(now)).collect(),
            listener_details: st.listeners.infos(),
        }
    }

    // ---- cleanup ----

    /// Evict connections the policy rejects and drop orphaned subscriptions.
    pub async fn run_cleanup(&self) -> CleanupReport {
        let _gate = self.inner.gate.lock().await;
        let now = Instant::now();

        let (closed, evicted_subs, orphans) = {
            let mut st = self.state();
            let mut closed = Vec::new();
            let mut evicted_subs = Vec::new();

            for (conn_id, reason) in st.pool.evictable(&self.inner.policy, now) {
                if let Some(conn) = st.pool.remove(conn_id) {
                    let subs: Vec<SubscriptionId> = st.registry.on_connection(conn_id);
                    for id in &subs {
                        st.registry.remove(*id);
                    }
                    st.counters.evictions += 1;
                    evicted_subs.push((conn_id, reason, subs));
                    closed.push(conn);
                }
            }

            let orphans: Vec<SubscriptionId> = st
                .registry
                .iter()
                .filter(|s| !st.pool.contains(s.connection_id))
                .map(|s| s.id)
                .collect();
            for id in &orphans {
                st.registry.remove(*id);
            }
            (closed, evicted_subs, orphans)
        };

        for conn in closed {
            close_connection(conn).await;
        }

        let mut report = CleanupReport {
            removed_subscriptions: orphans.len(),
            ..Default::default()
        };
        for (connection_id, reason, subscription_ids) in evicted_subs {
            tracing::info!(
                connection_id = %connection_id,
                %reason,
                subscriptions = subscription_ids.len(),
                "Evicted realtime connection"
            );
            report.removed_subscriptions += subscription_ids.len();
            report.evicted.push((connection_id, reason));
            self.publish(RealtimeNotice::Evicted {
                connection_id,
                reason,
                subscription_ids,
            });
        }
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "Removed orphaned subscriptions");
            self.publish(RealtimeNotice::Removed {
                subscription_ids: orphans,
            });
        }
        if !report.is_empty() {
            self.publish_counts();
        }
        report
    }

    // ---- private helpers ----

    fn state(&self) -> MutexGuard<'_, State> {
        // Callbacks run outside the lock, so poisoning can only come from a
        // bug in this module; keep serving rather than cascading panics.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    pub(crate) fn publish(&self, notice: RealtimeNotice) {
        self.inner.notices.publish(notice);
    }

    fn publish_counts(&self) {
        let (connections, active_connections, subscriptions) = {
            let st = self.state();
            (st.pool.len(), st.pool.active_count(), st.registry.len())
        };
        self.publish(RealtimeNotice::StateChange {
            connections,
            active_connections,
        });
        self.publish(RealtimeNotice::SubscriptionChange { subscriptions });
    }

    pub(crate) fn record_error(&self) {
        self.state().counters.errors += 1;
    }

    async fn remove_many(&self, ids: Vec<SubscriptionId>, scope: &'static str) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let now = Instant::now();
        let detached: Vec<Detached> = {
            let mut st = self.state();
            ids.iter().filter_map(|id| st.detach(*id, now)).collect()
        };
        let removed: Vec<SubscriptionId> = detached.iter().map(|d| d.id).collect();
        for d in detached {
            d.finish().await;
        }
        tracing::info!(scope, count = removed.len(), "Removed subscriptions");
        let count = removed.len();
        self.publish(RealtimeNotice::Removed {
            subscription_ids: removed,
        });
        self.publish_counts();
        count
    }

    /// Body of `subscribe`; the caller holds the mutation gate.
    async fn subscribe_locked(
        &self,
        subscriber_id: &str,
        request: SubscribeRequest,
        callback: ChangeCallback,
    ) -> Result<SubscriptionId, RealtimeError> {
        if self.inner.cancel.is_cancelled() {
            return Err(RealtimeError::ShutDown);
        }
        if !self.is_enabled() {
            return Err(RealtimeError::Disabled);
        }

        let now = Instant::now();
        let id = SubscriptionId::new();
        let key = PoolKey {
            subscriber_id: subscriber_id.to_string(),
            origin: request.origin.clone(),
            class: request.class,
        };
        let binding = Binding {
            tag: id,
            table: request.table.clone(),
            event: request.event,
            filter: request.filter.clone(),
        };

        // Dedup, then reserve a slot on a reusable connection if one exists.
        let reused = {
            let mut st = self.state();
            if let Some(existing) = st.registry.find_duplicate(subscriber_id, &request) {
                if let Some(sub) = st.registry.get_mut(existing) {
                    sub.callback = callback;
                    sub.last_used = now;
                }
                tracing::debug!(
                    subscription_id = %existing,
                    subscriber_id,
                    table = %request.table,
                    "Reusing duplicate subscription; callback rebound"
                );
                return Ok(existing);
            }

            match st.pool.find_reusable(&key) {
                Some(conn_id) => {
                    st.counters.pool_hits += 1;
                    let channel = attach(&mut st, conn_id, id, subscriber_id, &request, &callback, now);
                    channel.map(|ch| (conn_id, ch))
                }
                None => {
                    st.counters.pool_misses += 1;
                    if !st.pool.has_capacity() {
                        let max = st.pool.max_connections();
                        tracing::warn!(subscriber_id, origin = %request.origin, max, "Realtime pool exhausted");
                        return Err(RealtimeError::PoolExhausted { max });
                    }
                    None
                }
            }
        };

        let (conn_id, channel) = match reused {
            Some(pair) => pair,
            None => {
                let (conn_id, channel) = self.open_connection(key).await?;
                let mut st = self.state();
                attach(&mut st, conn_id, id, subscriber_id, &request, &callback, now);
                (conn_id, channel)
            }
        };

        if let Err(e) = channel.on(binding).await {
            tracing::error!(subscription_id = %id, connection_id = %conn_id, error = %e, "Failed to bind subscription");
            let detached = {
                let mut st = self.state();
                st.counters.errors += 1;
                st.detach(id, Instant::now())
            };
            if let Some(d) = detached {
                d.finish().await;
            }
            self.publish_counts();
            return Err(e);
        }

        tracing::info!(
            subscription_id = %id,
            connection_id = %conn_id,
            subscriber_id,
            table = %request.table,
            event = %request.event,
            origin = %request.origin,
            class = %request.class,
            "Subscription created"
        );
        self.publish_counts();
        Ok(id)
    }

    /// Open a channel and register it in the pool with zero subscriptions.
    async fn open_connection(&self, key: PoolKey) -> Result<(ConnectionId, Arc<dyn PushChannel>), RealtimeError> {
        let conn_id = ConnectionId::new();
        let name = key.channel_name(&conn_id);

        let (channel, stream) = match self.inner.source.open_channel(&name).await {
            Ok(pair) => pair,
            Err(e) => {
                self.record_error();
                tracing::error!(channel = %name, error = %e, "Failed to open push channel");
                return Err(e);
            }
        };

        let pump_cancel = self.inner.cancel.child_token();
        let pump = tokio::spawn(pump_loop(
            Arc::downgrade(&self.inner),
            conn_id,
            stream,
            pump_cancel.clone(),
        ));

        let connection = Connection {
            id: conn_id,
            key,
            usage: Usage::new(Instant::now()),
            failed: false,
            channel: Arc::clone(&channel),
            pump_cancel,
            pump: Some(pump),
        };
        tracing::info!(connection_id = %conn_id, channel = %name, "Opened realtime connection");
        self.state().pool.insert(connection);
        Ok((conn_id, channel))
    }

    // ---- inbound messages ----

    fn handle_message(&self, conn_id: ConnectionId, message: ChannelMessage) {
        match message {
            ChannelMessage::Change { tag, event } => self.handle_change(conn_id, tag, &event),
            ChannelMessage::Status {
                tag: Some(tag),
                status,
                reason,
            } => self.handle_subscription_status(tag, status, reason),
            ChannelMessage::Status {
                tag: None,
                status,
                reason,
            } => self.handle_channel_status(conn_id, status, reason),
        }
    }

    fn handle_change(&self, conn_id: ConnectionId, tag: SubscriptionId, event: &ChangeEvent) {
        let now = Instant::now();
        let (owner, listeners) = {
            let mut st = self.state();
            st.counters.events_received += 1;

            let Some(sub) = st.registry.get_mut(tag) else {
                tracing::debug!(subscription_id = %tag, "Change for removed subscription dropped");
                return;
            };
            sub.last_used = now;
            let owner = Arc::clone(&sub.callback);

            if let Some(conn) = st.pool.get_mut(conn_id) {
                conn.usage.touch(now);
            }

            let listeners = if st.recent.insert(event.dedup_key(chrono::Utc::now())) {
                st.listeners.matching(event)
            } else {
                st.counters.duplicate_events += 1;
                Vec::new()
            };
            (owner, listeners)
        };

        let mut failures = 0u64;
        if let Err(e) = invoke(&owner, event) {
            failures += 1;
            tracing::warn!(subscription_id = %tag, table = %event.table, error = %e, "Subscription callback failed");
        }
        for (listener_id, cb) in listeners {
            if let Err(e) = invoke(&cb, event) {
                failures += 1;
                tracing::warn!(listener_id = %listener_id, table = %event.table, error = %e, "Listener callback failed");
            }
        }
        if failures > 0 {
            self.state().counters.errors += failures;
        }
    }

    fn handle_subscription_status(&self, tag: SubscriptionId, status: ChannelStatus, reason: Option<String>) {
        match status {
            ChannelStatus::Subscribed => {
                let mut st = self.state();
                if let Some(sub) = st.registry.get_mut(tag) {
                    if sub.state == SubscriptionState::Subscribing {
                        sub.state = SubscriptionState::Subscribed;
                    }
                }
                drop(st);
                tracing::debug!(subscription_id = %tag, "Subscription acknowledged");
            }
            ChannelStatus::Closed => {
                tracing::debug!(subscription_id = %tag, "Subscription binding closed");
            }
            failure => self.begin_reconnect(tag, failure, reason),
        }
    }

    fn handle_channel_status(&self, conn_id: ConnectionId, status: ChannelStatus, reason: Option<String>) {
        if !status.is_failure() {
            tracing::debug!(connection_id = %conn_id, %status, "Channel status");
            return;
        }

        let affected = {
            let mut st = self.state();
            match st.pool.get_mut(conn_id) {
                Some(conn) => conn.failed = true,
                None => return,
            }
            st.registry.on_connection(conn_id)
        };
        tracing::warn!(
            connection_id = %conn_id,
            %status,
            reason = reason.as_deref().unwrap_or(""),
            subscriptions = affected.len(),
            "Channel failed; rebuilding its subscriptions"
        );
        for tag in affected {
            self.begin_reconnect(tag, status, reason.clone());
        }
    }

    /// Move a subscription to `PendingReconnect` and schedule one rebuild.
    fn begin_reconnect(&self, tag: SubscriptionId, status: ChannelStatus, reason: Option<String>) {
        {
            let mut st = self.state();
            let Some(sub) = st.registry.get_mut(tag) else {
                return;
            };
            if sub.state == SubscriptionState::PendingReconnect {
                tracing::debug!(subscription_id = %tag, %status, "Already pending reconnect; status ignored");
                return;
            }
            sub.state = SubscriptionState::PendingReconnect;
            st.counters.errors += 1;
            st.counters.reconnects += 1;
        }

        tracing::warn!(
            subscription_id = %tag,
            %status,
            reason = reason.as_deref().unwrap_or(""),
            backoff_secs = self.inner.config.reconnect_backoff.as_secs(),
            "Subscription failed; reconnect scheduled"
        );

        let manager = self.clone();
        let backoff = self.inner.config.reconnect_backoff;
        let cancel = self.inner.cancel.child_token();
        let handle = tokio::spawn(async move {
            reconnect::supervise(manager, tag, backoff, cancel).await;
        });
        self.track(handle);
    }

    /// Replace a subscription that is pending reconnect with a fresh one
    /// carrying the same parameters and callback.
    ///
    /// Returns `Ok(None)` if the subscription was removed in the meantime.
    pub(crate) async fn resubscribe(&self, previous: SubscriptionId) -> Result<Option<SubscriptionId>, RealtimeError> {
        let _gate = self.inner.gate.lock().await;

        let (subscriber_id, request, callback, detached) = {
            let mut st = self.state();
            let Some(sub) = st.registry.get(previous) else {
                return Ok(None);
            };
            if sub.state != SubscriptionState::PendingReconnect {
                return Ok(None);
            }
            let captured = (
                sub.subscriber_id.clone(),
                sub.request.clone(),
                Arc::clone(&sub.callback),
            );
            let detached = st.detach(previous, Instant::now());
            (captured.0, captured.1, captured.2, detached)
        };
        if let Some(d) = detached {
            d.finish().await;
        }

        // A same-parameter subscription made during backoff absorbs the
        // rebuild and keeps its own, newer callback.
        if let Some(existing) = self.state().registry.find_duplicate(&subscriber_id, &request) {
            return Ok(Some(existing));
        }

        self.subscribe_locked(&subscriber_id, request, callback)
            .await
            .map(Some)
    }
}

/// Insert a subscription record on `conn_id` and bump its count. Returns
/// the connection's channel.
fn attach(
    st: &mut State,
    conn_id: ConnectionId,
    id: SubscriptionId,
    subscriber_id: &str,
    request: &SubscribeRequest,
    callback: &ChangeCallback,
    now: Instant,
) -> Option<Arc<dyn PushChannel>> {
    let conn = st.pool.get_mut(conn_id)?;
    conn.usage.subscription_count += 1;
    conn.usage.touch(now);
    let channel = Arc::clone(&conn.channel);

    st.registry.insert(SubscriptionRecord {
        id,
        subscriber_id: subscriber_id.to_string(),
        request: request.clone(),
        connection_id: conn_id,
        created_at: now,
        last_used: now,
        state: SubscriptionState::Subscribing,
        callback: Arc::clone(callback),
    });
    Some(channel)
}

/// Drain one connection's message stream in arrival order.
async fn pump_loop(
    inner: Weak<Inner>,
    conn_id: ConnectionId,
    mut stream: MessageStream,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.recv() => message,
        };
        let Some(message) = message else {
            tracing::debug!(connection_id = %conn_id, "Channel stream ended");
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        RealtimeManager { inner }.handle_message(conn_id, message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::dispatch::callback;
    use crate::memory::LocalPushSource;

    fn manager_with(config: RealtimeConfig) -> (RealtimeManager, LocalPushSource) {
        let source = LocalPushSource::new();
        let manager = RealtimeManager::new(config, Arc::new(source.clone()));
        (manager, source)
    }

    fn counting() -> (ChangeCallback, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let cb = callback(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (cb, hits)
    }

    // -- subscribe ------------------------------------------------------------

    #[tokio::test]
    async fn subscribe_opens_one_connection_per_key() {
        let (manager, source) = manager_with(RealtimeConfig::default());
        let (cb, _) = counting();

        manager
            .subscribe("u1", SubscribeRequest::new("a").origin("board"), cb.clone())
            .await
            .unwrap();
        manager
            .subscribe("u1", SubscribeRequest::new("b").origin("board"), cb.clone())
            .await
            .unwrap();

        assert_eq!(source.opened_total(), 1);
        let stats = manager.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.subscriptions, 2);
        assert_eq!(stats.counters.pool_hits, 1);
        assert_eq!(stats.counters.pool_misses, 1);
    }

    #[tokio::test]
    async fn disabled_manager_rejects_subscribe() {
        let (manager, source) = manager_with(RealtimeConfig {
            enabled: false,
            ..Default::default()
        });
        let (cb, _) = counting();
        let result = manager.subscribe("u1", SubscribeRequest::new("a"), cb).await;
        assert_matches!(result, Err(RealtimeError::Disabled));
        assert_eq!(source.opened_total(), 0);
    }

    #[tokio::test]
    async fn open_failure_counts_error() {
        let (manager, source) = manager_with(RealtimeConfig::default());
        source.set_fail_open(true);
        let (cb, _) = counting();
        let result = manager.subscribe("u1", SubscribeRequest::new("a"), cb).await;
        assert_matches!(result, Err(RealtimeError::ChannelError(_)));
        assert_eq!(manager.stats().counters.errors, 1);
        assert_eq!(manager.connection_count(), 0);
    }

    // -- unsubscribe ----------------------------------------------------------

    #[tokio::test]
    async fn last_unsubscribe_closes_connection() {
        let (manager, source) = manager_with(RealtimeConfig::default());
        let (cb, _) = counting();
        let a = manager
            .subscribe("u1", SubscribeRequest::new("a"), cb.clone())
            .await
            .unwrap();
        let b = manager
            .subscribe("u1", SubscribeRequest::new("b"), cb)
            .await
            .unwrap();

        manager.unsubscribe(a).await;
        assert_eq!(source.open_channels(), 1);
        assert_eq!(source.binding_count(), 1);

        manager.unsubscribe(b).await;
        assert_eq!(source.open_channels(), 0);
        assert_eq!(manager.connection_count(), 0);

        // Unknown id: no-op.
        manager.unsubscribe(b).await;
        assert_eq!(manager.subscription_count(), 0);
    }

    // -- dispatch -------------------------------------------------------------

    #[tokio::test]
    async fn change_reaches_owner_and_listener_once() {
        let (manager, source) = manager_with(RealtimeConfig::default());
        let (owner_a, hits_a) = counting();
        let (owner_b, hits_b) = counting();
        let (listener, listener_hits) = counting();

        manager
            .subscribe("u1", SubscribeRequest::new("t"), owner_a)
            .await
            .unwrap();
        manager
            .subscribe("u2", SubscribeRequest::new("t"), owner_b)
            .await
            .unwrap();
        manager.register_listener("t", EventFilter::All, "board", listener);

        let event = ChangeEvent::update("t", json!({"id": 1}), None)
            .at(chrono::Utc::now());
        assert_eq!(source.emit(event).await, 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
        assert_eq!(listener_hits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().counters.duplicate_events, 1);
    }

    #[tokio::test]
    async fn failing_callback_does_not_block_others() {
        let (manager, source) = manager_with(RealtimeConfig::default());
        manager
            .subscribe("u1", SubscribeRequest::new("t"), callback(|_| panic!("bad callback")))
            .await
            .unwrap();
        let (listener, listener_hits) = counting();
        manager.register_listener("t", EventFilter::All, "board", listener);

        source.emit(ChangeEvent::insert("t", json!({"id": 1}))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(listener_hits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().counters.errors, 1);
    }

    // -- visibility -----------------------------------------------------------

    #[tokio::test]
    async fn pause_only_touches_page_connections() {
        let (manager, _source) = manager_with(RealtimeConfig::default());
        let (cb, _) = counting();
        manager
            .subscribe("u1", SubscribeRequest::new("a"), cb.clone())
            .await
            .unwrap();
        manager
            .subscribe(
                "u1",
                SubscribeRequest::new("a").class(ConnectionClass::LongTerm).origin("locks"),
                cb,
            )
            .await
            .unwrap();

        assert_eq!(manager.pause_page_connections(), 1);
        assert_eq!(manager.stats().active_connections, 1);
        assert_eq!(manager.resume_page_connections(), 1);
        assert_eq!(manager.stats().active_connections, 2);
    }

    // -- bulk cleanup ---------------------------------------------------------

    #[tokio::test]
    async fn cleanup_by_origin_and_class() {
        let (manager, _source) = manager_with(RealtimeConfig::default());
        let (cb, _) = counting();
        manager
            .subscribe("u1", SubscribeRequest::new("a").origin("board"), cb.clone())
            .await
            .unwrap();
        manager
            .subscribe("u1", SubscribeRequest::new("b").origin("board"), cb.clone())
            .await
            .unwrap();
        manager
            .subscribe(
                "u1",
                SubscribeRequest::new("c").origin("locks").class(ConnectionClass::LongTerm),
                cb,
            )
            .await
            .unwrap();

        assert_eq!(manager.cleanup_by_origin("board").await, 2);
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(manager.cleanup_by_class(ConnectionClass::LongTerm).await, 1);
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn set_enabled_false_tears_down() {
        let (manager, source) = manager_with(RealtimeConfig::default());
        let (cb, _) = counting();
        manager
            .subscribe("u1", SubscribeRequest::new("a"), cb.clone())
            .await
            .unwrap();

        manager.set_enabled(false).await;
        assert_eq!(source.open_channels(), 0);
        assert_eq!(manager.subscription_count(), 0);
        assert_matches!(
            manager.subscribe("u1", SubscribeRequest::new("a"), cb).await,
            Err(RealtimeError::Disabled)
        );
    }

    #[tokio::test]
    async fn shutdown_rejects_further_subscribes() {
        let (manager, source) = manager_with(RealtimeConfig::default());
        manager.start();
        let (cb, _) = counting();
        manager
            .subscribe("u1", SubscribeRequest::new("a"), cb.clone())
            .await
            .unwrap();

        manager.shutdown().await;
        assert_eq!(source.open_channels(), 0);
        assert_matches!(
            manager.subscribe("u1", SubscribeRequest::new("a"), cb).await,
            Err(RealtimeError::ShutDown)
        );
    }
}
