//! In-process push source.
//!
//! [`LocalPushSource`] delivers changes emitted by the same process (for
//! example by an in-memory schedule store) and lets tests inject channel
//! failures. Channels and bindings are plain in-memory records; nothing
//! crosses a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RealtimeError;
use crate::event::ChangeEvent;
use crate::ids::SubscriptionId;
use crate::source::{
    Binding, ChannelMessage, ChannelStatus, MessageStream, PushChannel, PushSource, CHANNEL_BUFFER,
};

#[derive(Default)]
struct LocalInner {
    channels: Mutex<HashMap<u64, LocalChannelState>>,
    next_id: AtomicU64,
    opened_total: AtomicUsize,
    fail_open: AtomicBool,
    /// Suppress the `SUBSCRIBED` acknowledgement on new bindings.
    silent_bindings: AtomicBool,
}

struct LocalChannelState {
    name: String,
    tx: mpsc::Sender<ChannelMessage>,
    bindings: Vec<Binding>,
}

impl LocalInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<u64, LocalChannelState>> {
        // A poisoned map only means a panicking test thread; the data is still usable.
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Push source backed by in-process channels.
#[derive(Clone, Default)]
pub struct LocalPushSource {
    inner: Arc<LocalInner>,
}

impl LocalPushSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `open_channel` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Stop acknowledging new bindings with `SUBSCRIBED`.
    pub fn set_silent_bindings(&self, silent: bool) {
        self.inner.silent_bindings.store(silent, Ordering::SeqCst);
    }

    /// Channels currently open.
    pub fn open_channels(&self) -> usize {
        self.inner.channels().len()
    }

    /// Channels opened since construction, including closed ones.
    pub fn opened_total(&self) -> usize {
        self.inner.opened_total.load(Ordering::SeqCst)
    }

    /// Bindings across all open channels.
    pub fn binding_count(&self) -> usize {
        self.inner.channels().values().map(|c| c.bindings.len()).sum()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner.channels().values().map(|c| c.name.clone()).collect()
    }

    /// Deliver `event` to every binding that matches it. Returns the number
    /// of deliveries.
    pub async fn emit(&self, event: ChangeEvent) -> usize {
        let targets: Vec<(mpsc::Sender<ChannelMessage>, SubscriptionId)> = {
            let channels = self.inner.channels();
            channels
                .values()
                .flat_map(|channel| {
                    channel
                        .bindings
                        .iter()
                        .filter(|b| b.matches(&event))
                        .map(|b| (channel.tx.clone(), b.tag))
                })
                .collect()
        };

        let mut delivered = 0;
        for (tx, tag) in targets {
            let message = ChannelMessage::Change {
                tag,
                event: event.clone(),
            };
            if tx.send(message).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Report `status` for a single binding. Returns `false` if no open
    /// channel carries `tag`.
    pub async fn fail_binding(&self, tag: SubscriptionId, status: ChannelStatus) -> bool {
        let Some(tx) = self.sender_for(tag) else {
            return false;
        };
        tx.send(ChannelMessage::Status {
            tag: Some(tag),
            status,
            reason: Some("injected".into()),
        })
        .await
        .is_ok()
    }

    /// Report a channel-wide `status` on the channel that carries `tag`.
    pub async fn fail_channel_of(&self, tag: SubscriptionId, status: ChannelStatus) -> bool {
        let Some(tx) = self.sender_for(tag) else {
            return false;
        };
        tx.send(ChannelMessage::Status {
            tag: None,
            status,
            reason: Some("injected".into()),
        })
        .await
        .is_ok()
    }

    fn sender_for(&self, tag: SubscriptionId) -> Option<mpsc::Sender<ChannelMessage>> {
        self.inner
            .channels()
            .values()
            .find(|c| c.bindings.iter().any(|b| b.tag == tag))
            .map(|c| c.tx.clone())
    }
}

#[async_trait]
impl PushSource for LocalPushSource {
    async fn open_channel(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn PushChannel>, MessageStream), RealtimeError> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(RealtimeError::ChannelError(format!(
                "refused to open channel {name}"
            )));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.channels().insert(
            id,
            LocalChannelState {
                name: name.to_string(),
                tx,
                bindings: Vec::new(),
            },
        );
        self.inner.opened_total.fetch_add(1, Ordering::SeqCst);

        let channel = LocalChannel {
            id,
            inner: Arc::clone(&self.inner),
        };
        Ok((Arc::new(channel), rx))
    }
}

struct LocalChannel {
    id: u64,
    inner: Arc<LocalInner>,
}

#[async_trait]
impl PushChannel for LocalChannel {
    async fn on(&self, binding: Binding) -> Result<(), RealtimeError> {
        let tag = binding.tag;
        let tx = {
            let mut channels = self.inner.channels();
            let state = channels
                .get_mut(&self.id)
                .ok_or_else(|| RealtimeError::ChannelError("channel is closed".into()))?;
            state.bindings.push(binding);
            state.tx.clone()
        };

        if !self.inner.silent_bindings.load(Ordering::SeqCst) {
            let _ = tx
                .send(ChannelMessage::Status {
                    tag: Some(tag),
                    status: ChannelStatus::Subscribed,
                    reason: None,
                })
                .await;
        }
        Ok(())
    }

    async fn off(&self, tag: SubscriptionId) {
        if let Some(state) = self.inner.channels().get_mut(&self.id) {
            state.bindings.retain(|b| b.tag != tag);
        }
    }

    async fn close(&self) {
        self.inner.channels().remove(&self.id);
    }
}
