//! Subscription records and structural de-duplication.

use std::collections::HashMap;

use serde::Serialize;
use tokio::time::Instant;

use crate::dispatch::ChangeCallback;
use crate::event::EventFilter;
use crate::filter::RowFilter;
use crate::ids::{ConnectionId, SubscriptionId};
use crate::pool::ConnectionClass;

/// Origin recorded when the caller does not name one.
pub const UNKNOWN_ORIGIN: &str = "unknown";

// ---------------------------------------------------------------------------
// SubscribeRequest
// ---------------------------------------------------------------------------

/// What to listen for, and on which class of connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
    /// Free-form tag naming the consumer (a page, a background task).
    pub origin: String,
    pub class: ConnectionClass,
}

impl SubscribeRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            event: EventFilter::All,
            filter: None,
            origin: UNKNOWN_ORIGIN.to_string(),
            class: ConnectionClass::Page,
        }
    }

    pub fn event(mut self, event: impl Into<EventFilter>) -> Self {
        self.event = event.into();
        self
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn class(mut self, class: ConnectionClass) -> Self {
        self.class = class;
        self
    }

    /// Same (table, event, filter, origin). The class is not part of the
    /// identity.
    pub fn same_target(&self, other: &SubscribeRequest) -> bool {
        self.table == other.table
            && self.event == other.event
            && self.filter == other.filter
            && self.origin == other.origin
    }
}

// ---------------------------------------------------------------------------
// SubscriptionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Binding registered, acknowledgement not yet seen.
    Subscribing,
    Subscribed,
    /// A failure status was seen; a rebuild is scheduled.
    PendingReconnect,
}

pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub subscriber_id: String,
    pub request: SubscribeRequest,
    pub connection_id: ConnectionId,
    pub created_at: Instant,
    pub last_used: Instant,
    pub state: SubscriptionState,
    pub callback: ChangeCallback,
}

/// Serializable view of a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub subscriber_id: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
    pub origin: String,
    pub class: ConnectionClass,
    pub connection_id: ConnectionId,
    pub state: SubscriptionState,
    pub age_secs: u64,
    pub idle_secs: u64,
}

impl SubscriptionRecord {
    pub fn info(&self, now: Instant) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            subscriber_id: self.subscriber_id.clone(),
            table: self.request.table.clone(),
            event: self.request.event,
            filter: self.request.filter.clone(),
            origin: self.request.origin.clone(),
            class: self.request.class,
            connection_id: self.connection_id,
            state: self.state,
            age_secs: now.saturating_duration_since(self.created_at).as_secs(),
            idle_secs: now.saturating_duration_since(self.last_used).as_secs(),
        }
    }
}

/// Live subscriptions sharing a (table, event, filter) target across
/// subscribers or origins.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
    pub subscription_ids: Vec<SubscriptionId>,
    pub subscriber_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Registry {
    subscriptions: HashMap<SubscriptionId, SubscriptionRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently used live subscription with the same subscriber
    /// and target, if any.
    ///
    /// Subscriptions awaiting a rebuild are skipped; their id is about to be
    /// replaced.
    pub fn find_duplicate(&self, subscriber_id: &str, request: &SubscribeRequest) -> Option<SubscriptionId> {
        self.subscriptions
            .values()
            .filter(|s| s.state != SubscriptionState::PendingReconnect)
            .filter(|s| s.subscriber_id == subscriber_id && s.request.same_target(request))
            .max_by_key(|s| s.last_used)
            .map(|s| s.id)
    }

    pub fn insert(&mut self, record: SubscriptionRecord) {
        self.subscriptions.insert(record.id, record);
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<SubscriptionRecord> {
        self.subscriptions.remove(&id)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&SubscriptionRecord> {
        self.subscriptions.get(&id)
    }

    pub fn get_mut(&mut self, id: SubscriptionId) -> Option<&mut SubscriptionRecord> {
        self.subscriptions.get_mut(&id)
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionRecord> {
        self.subscriptions.values()
    }

    pub fn ids_where(&self, pred: impl Fn(&SubscriptionRecord) -> bool) -> Vec<SubscriptionId> {
        self.subscriptions
            .values()
            .filter(|s| pred(s))
            .map(|s| s.id)
            .collect()
    }

    pub fn on_connection(&self, connection_id: ConnectionId) -> Vec<SubscriptionId> {
        self.ids_where(|s| s.connection_id == connection_id)
    }

    pub fn duplicate_groups(&self) -> Vec<DuplicateGroup> {
        let mut groups: HashMap<(String, EventFilter, Option<RowFilter>), Vec<&SubscriptionRecord>> =
            HashMap::new();
        for sub in self.subscriptions.values() {
            let key = (
                sub.request.table.clone(),
                sub.request.event,
                sub.request.filter.clone(),
            );
            groups.entry(key).or_default().push(sub);
        }

        let mut duplicates: Vec<DuplicateGroup> = groups
            .into_iter()
            .filter(|(_, subs)| subs.len() > 1)
            .map(|((table, event, filter), mut subs)| {
                subs.sort_by_key(|s| s.created_at);
                DuplicateGroup {
                    table,
                    event,
                    filter,
                    subscription_ids: subs.iter().map(|s| s.id).collect(),
                    subscriber_ids: subs.iter().map(|s| s.subscriber_id.clone()).collect(),
                }
            })
            .collect();
        duplicates.sort_by(|a, b| a.table.cmp(&b.table));
        duplicates
    }

    pub fn drain(&mut self) -> Vec<SubscriptionRecord> {
        self.subscriptions.drain().map(|(_, s)| s).collect()
    }
}
