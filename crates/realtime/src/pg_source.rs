//! Postgres `LISTEN/NOTIFY` push source.
//!
//! Each channel holds its own [`PgListener`] on the notification channel
//! that the schedule table's trigger publishes to, and routes each decoded
//! change to the bindings it matches.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RealtimeError;
use crate::event::ChangeEvent;
use crate::ids::SubscriptionId;
use crate::source::{
    Binding, ChannelMessage, ChannelStatus, MessageStream, PushChannel, PushSource, CHANNEL_BUFFER,
};

/// Notification channel the `notify_realtime_change` trigger publishes to.
pub const DEFAULT_NOTIFY_CHANNEL: &str = "realtime_changes";

/// Push source that opens one `LISTEN` connection per channel.
#[derive(Clone)]
pub struct PgPushSource {
    pool: PgPool,
    notify_channel: String,
}

impl PgPushSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            notify_channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
        }
    }

    pub fn with_notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.notify_channel = channel.into();
        self
    }

    /// Open and immediately drop a listener to confirm `LISTEN` works.
    pub async fn ping(&self) -> Result<(), RealtimeError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| RealtimeError::ChannelError(e.to_string()))?;
        listener
            .listen(&self.notify_channel)
            .await
            .map_err(|e| RealtimeError::ChannelError(e.to_string()))?;
        Ok(())
    }
}

type SharedBindings = Arc<Mutex<Vec<Binding>>>;

fn lock(bindings: &SharedBindings) -> MutexGuard<'_, Vec<Binding>> {
    bindings.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl PushSource for PgPushSource {
    async fn open_channel(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn PushChannel>, MessageStream), RealtimeError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| RealtimeError::ChannelError(e.to_string()))?;
        listener
            .listen(&self.notify_channel)
            .await
            .map_err(|e| RealtimeError::ChannelError(e.to_string()))?;

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let bindings: SharedBindings = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(listen_loop(
            name.to_string(),
            listener,
            Arc::clone(&bindings),
            tx.clone(),
            cancel.clone(),
        ));

        tracing::debug!(channel = %name, notify_channel = %self.notify_channel, "Opened LISTEN channel");

        let channel = PgChannel {
            bindings,
            tx,
            cancel,
        };
        Ok((Arc::new(channel), rx))
    }
}

/// Forward notifications until cancelled or the listener fails.
async fn listen_loop(
    name: String,
    mut listener: PgListener,
    bindings: SharedBindings,
    tx: mpsc::Sender<ChannelMessage>,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.recv() => result,
        };

        let notification = match notification {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(channel = %name, error = %e, "LISTEN connection failed");
                let _ = tx
                    .send(ChannelMessage::Status {
                        tag: None,
                        status: ChannelStatus::ChannelError,
                        reason: Some(e.to_string()),
                    })
                    .await;
                break;
            }
        };

        let event = match ChangeEvent::from_json(notification.payload()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel = %name, error = %e, "Dropping malformed change notification");
                continue;
            }
        };

        let tags: Vec<SubscriptionId> = lock(&bindings)
            .iter()
            .filter(|b| b.matches(&event))
            .map(|b| b.tag)
            .collect();

        for tag in tags {
            let message = ChannelMessage::Change {
                tag,
                event: event.clone(),
            };
            if tx.send(message).await.is_err() {
                return;
            }
        }
    }
    tracing::debug!(channel = %name, "LISTEN loop exited");
}

struct PgChannel {
    bindings: SharedBindings,
    tx: mpsc::Sender<ChannelMessage>,
    cancel: CancellationToken,
}

#[async_trait]
impl PushChannel for PgChannel {
    async fn on(&self, binding: Binding) -> Result<(), RealtimeError> {
        if self.cancel.is_cancelled() {
            return Err(RealtimeError::ChannelError("channel is closed".into()));
        }
        let tag = binding.tag;
        lock(&self.bindings).push(binding);
        // The LISTEN is already active, so the binding is live immediately.
        let _ = self
            .tx
            .send(ChannelMessage::Status {
                tag: Some(tag),
                status: ChannelStatus::Subscribed,
                reason: None,
            })
            .await;
        Ok(())
    }

    async fn off(&self, tag: SubscriptionId) {
        lock(&self.bindings).retain(|b| b.tag != tag);
    }

    async fn close(&self) {
        self.cancel.cancel();
        lock(&self.bindings).clear();
    }
}
