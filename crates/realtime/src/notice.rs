//! In-process notice bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`NoticeBus`] publishes pool and subscription lifecycle notices so that
//! observers (the lock observer, a status endpoint) can react to state
//! changes without polling the manager.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::ids::{ConnectionId, SubscriptionId};
use crate::pool::EvictionReason;

// ---------------------------------------------------------------------------
// RealtimeNotice
// ---------------------------------------------------------------------------

/// A lifecycle notice emitted by the realtime manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeNotice {
    /// The set of open connections changed.
    StateChange {
        connections: usize,
        active_connections: usize,
    },
    /// The set of live subscriptions changed.
    SubscriptionChange { subscriptions: usize },
    /// A failed subscription was rebuilt under a new id.
    Resubscribed {
        previous: SubscriptionId,
        current: SubscriptionId,
    },
    /// The rebuild of a failed subscription did not succeed; it will not be
    /// retried automatically.
    ReconnectFailed {
        subscription_id: SubscriptionId,
        error: String,
    },
    /// A connection was closed by the cleanup scheduler, taking these
    /// subscriptions with it.
    Evicted {
        connection_id: ConnectionId,
        reason: EvictionReason,
        subscription_ids: Vec<SubscriptionId>,
    },
    /// Subscriptions removed by a bulk cleanup or by disabling realtime.
    Removed { subscription_ids: Vec<SubscriptionId> },
}

impl RealtimeNotice {
    /// `true` if `id` is no longer live after this notice.
    pub fn ends_subscription(&self, id: SubscriptionId) -> bool {
        match self {
            RealtimeNotice::Resubscribed { previous, .. } => *previous == id,
            RealtimeNotice::ReconnectFailed {
                subscription_id, ..
            } => *subscription_id == id,
            RealtimeNotice::Evicted {
                subscription_ids, ..
            }
            | RealtimeNotice::Removed { subscription_ids } => subscription_ids.contains(&id),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// NoticeBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out bus for [`RealtimeNotice`]s.
pub struct NoticeBus {
    sender: broadcast::Sender<RealtimeNotice>,
}

impl NoticeBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// Slow receivers observe `RecvError::Lagged` once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a notice to all current subscribers.
    pub fn publish(&self, notice: RealtimeNotice) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeNotice> {
        self.sender.subscribe()
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
