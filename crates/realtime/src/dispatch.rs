//! Change callbacks, the listener registry, and listener de-duplication.
//!
//! A change is always delivered to the subscription that received it.
//! Fan-out to listeners is gated by a bounded set of recently seen event
//! keys, so the same change arriving on several subscriptions reaches each
//! listener once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crate::event::{ChangeEvent, EventFilter};
use crate::ids::ListenerId;

/// Error returned by a change callback.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) -> Result<(), CallbackError> + Send + Sync>;

/// Wrap a closure as a [`ChangeCallback`].
pub fn callback<F>(f: F) -> ChangeCallback
where
    F: Fn(&ChangeEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Run a callback, converting a panic into an error.
pub fn invoke(callback: &ChangeCallback, event: &ChangeEvent) -> Result<(), CallbackError> {
    match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "callback panicked".to_string());
            Err(CallbackError(format!("panic: {message}")))
        }
    }
}

// ---------------------------------------------------------------------------
// RecentKeys
// ---------------------------------------------------------------------------

/// FIFO-bounded set of recently seen event keys.
pub struct RecentKeys {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentKeys {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

pub struct Listener {
    pub id: ListenerId,
    pub table: String,
    pub event: EventFilter,
    pub origin: String,
    pub callback: ChangeCallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub id: ListenerId,
    pub table: String,
    pub event: EventFilter,
    pub origin: String,
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: HashMap<ListenerId, Listener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same callback for the same
    /// (table, event, origin) returns the existing id.
    pub fn register(
        &mut self,
        table: &str,
        event: EventFilter,
        origin: &str,
        callback: ChangeCallback,
    ) -> (ListenerId, bool) {
        if let Some(existing) = self.listeners.values().find(|l| {
            l.table == table
                && l.event == event
                && l.origin == origin
                && Arc::ptr_eq(&l.callback, &callback)
        }) {
            return (existing.id, false);
        }

        let id = ListenerId::new();
        self.listeners.insert(
            id,
            Listener {
                id,
                table: table.to_string(),
                event,
                origin: origin.to_string(),
                callback,
            },
        );
        (id, true)
    }

    pub fn unregister(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn remove_by_origin(&mut self, origin: &str) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|_, l| l.origin != origin);
        before - self.listeners.len()
    }

    /// Callbacks of every listener interested in `event`.
    pub fn matching(&self, event: &ChangeEvent) -> Vec<(ListenerId, ChangeCallback)> {
        self.listeners
            .values()
            .filter(|l| l.table == event.table && l.event.matches(event.kind))
            .map(|l| (l.id, Arc::clone(&l.callback)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn infos(&self) -> Vec<ListenerInfo> {
        self.listeners
            .values()
            .map(|l| ListenerInfo {
                id: l.id,
                table: l.table.clone(),
                event: l.event,
                origin: l.origin.clone(),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}
