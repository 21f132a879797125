//! Push Event Source contract.
//!
//! A source opens named channels. Each channel accepts bindings (table,
//! event filter, optional row filter) tagged with the subscription that owns
//! them, and reports both row changes and status transitions on a single
//! ordered message stream.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::RealtimeError;
use crate::event::{ChangeEvent, EventFilter};
use crate::filter::RowFilter;
use crate::ids::SubscriptionId;

/// Buffer size of a channel's message stream.
pub const CHANNEL_BUFFER: usize = 256;

/// A (table, event, filter) registration on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub tag: SubscriptionId,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
}

impl Binding {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self.event.matches(event.kind)
            && match (&self.filter, event.row()) {
                (None, _) => true,
                (Some(filter), Some(row)) => filter.matches(row),
                (Some(_), None) => false,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        }
    }

    /// Statuses that trigger a rebuild of the affected subscription.
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::ChannelError | ChannelStatus::TimedOut)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item on a channel's message stream.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// A change that matched the binding tagged `tag`.
    Change { tag: SubscriptionId, event: ChangeEvent },
    /// A status transition. `tag = None` applies to the whole channel.
    Status {
        tag: Option<SubscriptionId>,
        status: ChannelStatus,
        reason: Option<String>,
    },
}

pub type MessageStream = mpsc::Receiver<ChannelMessage>;

/// An open push channel.
#[async_trait]
pub trait PushChannel: Send + Sync + 'static {
    /// Register a binding. The source acknowledges with `SUBSCRIBED` (or a
    /// failure status) on the message stream.
    async fn on(&self, binding: Binding) -> Result<(), RealtimeError>;

    /// Remove a binding. Unknown tags are ignored.
    async fn off(&self, tag: SubscriptionId);

    /// Close the channel. The message stream ends once drained.
    async fn close(&self);
}

/// Opens push channels.
#[async_trait]
pub trait PushSource: Send + Sync + 'static {
    async fn open_channel(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn PushChannel>, MessageStream), RealtimeError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::ChangeKind;

    fn binding(filter: Option<&str>) -> Binding {
        Binding {
            tag: SubscriptionId::new(),
            table: "live_stream_schedules".into(),
            event: EventFilter::Only(ChangeKind::Update),
            filter: filter.map(|f| f.parse().unwrap()),
        }
    }

    #[test]
    fn binding_matches_table_and_kind() {
        let b = binding(None);
        assert!(b.matches(&ChangeEvent::update("live_stream_schedules", json!({"id": 1}), None)));
        assert!(!b.matches(&ChangeEvent::update("other", json!({"id": 1}), None)));
        assert!(!b.matches(&ChangeEvent::insert("live_stream_schedules", json!({"id": 1}))));
    }

    #[test]
    fn binding_applies_row_filter() {
        let b = binding(Some("id=eq.2"));
        assert!(b.matches(&ChangeEvent::update("live_stream_schedules", json!({"id": 2}), None)));
        assert!(!b.matches(&ChangeEvent::update("live_stream_schedules", json!({"id": 3}), None)));
    }

    #[test]
    fn failure_statuses() {
        assert!(ChannelStatus::ChannelError.is_failure());
        assert!(ChannelStatus::TimedOut.is_failure());
        assert!(!ChannelStatus::Closed.is_failure());
        assert!(!ChannelStatus::Subscribed.is_failure());
    }
}
