//! Lock observer fed by the realtime subscription pool.
//!
//! Subscribes to schedule changes on a `long-term` connection. A change
//! notification is only a hint: the observer re-reads the row from the store
//! and records that on the board. Pool notices drive the connectivity
//! indicator. While the subscription is gone the observer retries on the
//! poll interval and refetches the whole board once it is back.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use realtyops_core::schedule::SCHEDULES_TABLE;
use realtyops_core::types::DbId;
use realtyops_realtime::notice::RealtimeNotice;
use realtyops_realtime::registry::SubscriptionState;
use realtyops_realtime::{
    callback, CallbackError, ConnectionClass, RealtimeError, RealtimeManager, SubscribeRequest, SubscriptionId,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;
use crate::observer::{LockObserver, ObserverMode, RowSource};
use crate::protocol::EditLockManager;

/// Origin tag of the observer's subscription.
pub const OBSERVER_ORIGIN: &str = "lock-observer";

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    realtime: RealtimeManager,
    rows: RowSource,
    subscriber_id: String,
    reconciler: Option<EditLockManager>,
    retry_interval: Duration,
    subscription: Mutex<Option<SubscriptionId>>,
    hints: mpsc::UnboundedSender<DbId>,
}

pub struct PushLockObserver {
    inner: Arc<Inner>,
    hints_rx: Mutex<Option<mpsc::UnboundedReceiver<DbId>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushLockObserver {
    pub fn new(
        realtime: RealtimeManager,
        rows: RowSource,
        subscriber_id: impl Into<String>,
        retry_interval: Duration,
    ) -> Self {
        let (hints, hints_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                realtime,
                rows,
                subscriber_id: subscriber_id.into(),
                reconciler: None,
                retry_interval,
                subscription: Mutex::new(None),
                hints,
            }),
            hints_rx: Mutex::new(Some(hints_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Reconcile `manager`'s local lock set against every observed row.
    ///
    /// Must be called before [`start`](LockObserver::start).
    pub fn with_reconciler(mut self, manager: EditLockManager) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reconciler = Some(manager);
        }
        self
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        *lock(&self.inner.subscription)
    }
}

impl Inner {
    async fn subscribe(&self) -> Result<SubscriptionId, RealtimeError> {
        let hints = self.hints.clone();
        let on_change = callback(move |event| {
            let id = event
                .row_id()
                .ok_or_else(|| CallbackError::new(format!("{} change without a row id", event.table)))?;
            hints
                .send(id)
                .map_err(|_| CallbackError::new("lock observer stopped"))
        });

        let request = SubscribeRequest::new(SCHEDULES_TABLE)
            .origin(OBSERVER_ORIGIN)
            .class(ConnectionClass::LongTerm);
        let id = self.realtime.subscribe(&self.subscriber_id, request, on_change).await?;
        *lock(&self.subscription) = Some(id);
        self.rows.board.set_connected(true);
        tracing::info!(subscription_id = %id, "Lock observer subscribed");
        Ok(id)
    }

    /// Refetch the candidate set; a push gap may have hidden changes.
    async fn refresh_all(&self) {
        match self.rows.fetch_candidates().await {
            Ok(rows) => {
                if let Some(manager) = &self.reconciler {
                    manager.reconcile(&rows);
                }
                self.rows.board.replace_all(rows, self.rows.now());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Lock board refresh failed");
            }
        }
    }

    async fn refresh_one(&self, resource_id: DbId) {
        match self.rows.refresh(resource_id).await {
            Ok(Some(row)) => {
                if let Some(manager) = &self.reconciler {
                    manager.reconcile(std::slice::from_ref(&row));
                }
            }
            Ok(None) => {
                tracing::debug!(resource_id, "Changed schedule no longer exists");
            }
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "Failed to re-read changed schedule");
            }
        }
    }

    async fn handle_notice(&self, notice: RealtimeNotice) {
        let current = *lock(&self.subscription);
        let Some(ours) = current else {
            return;
        };

        match notice {
            RealtimeNotice::Resubscribed { previous, current } if previous == ours => {
                *lock(&self.subscription) = Some(current);
                self.rows.board.set_connected(true);
                tracing::info!(subscription_id = %current, "Lock observer resubscribed");
                self.refresh_all().await;
            }
            notice if notice.ends_subscription(ours) => {
                *lock(&self.subscription) = None;
                self.rows.board.set_connected(false);
                tracing::warn!(subscription_id = %ours, "Lock observer lost its subscription");
            }
            _ => {}
        }
    }

    async fn retry(&self) {
        if lock(&self.subscription).is_some() {
            return;
        }
        match self.subscribe().await {
            Ok(_) => self.refresh_all().await,
            Err(e) => {
                tracing::debug!(error = %e, "Lock observer resubscribe failed");
            }
        }
    }
}

#[async_trait]
impl LockObserver for PushLockObserver {
    fn mode(&self) -> ObserverMode {
        ObserverMode::Push
    }

    async fn start(&self) -> Result<(), LockError> {
        let Some(hints_rx) = lock(&self.hints_rx).take() else {
            return Ok(());
        };
        // Subscribe before the first fetch so no change falls in between.
        let notices = self.inner.realtime.notices();
        if let Err(e) = self.inner.subscribe().await {
            *lock(&self.hints_rx) = Some(hints_rx);
            return Err(e.into());
        }
        self.inner.refresh_all().await;

        let handle = tokio::spawn(follow(
            Arc::clone(&self.inner),
            hints_rx,
            notices,
            self.cancel.child_token(),
        ));
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(handle) = task {
            let _ = tokio::time::timeout(STOP_TIMEOUT, handle).await;
        }
        let subscription = lock(&self.inner.subscription).take();
        if let Some(id) = subscription {
            self.inner.realtime.unsubscribe(id).await;
        }
        self.inner.rows.board.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        let Some(id) = self.subscription_id() else {
            return false;
        };
        self.inner.rows.board.is_connected()
            && !matches!(
                self.inner.realtime.subscription_state(id),
                None | Some(SubscriptionState::PendingReconnect)
            )
    }

    fn rows(&self) -> &RowSource {
        &self.inner.rows
    }
}

/// Apply change hints and pool notices until cancelled.
async fn follow(
    inner: Arc<Inner>,
    mut hints: mpsc::UnboundedReceiver<DbId>,
    mut notices: broadcast::Receiver<RealtimeNotice>,
    cancel: CancellationToken,
) {
    tracing::info!("Lock observer started");
    let mut retry = tokio::time::interval(inner.retry_interval);
    retry.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Lock observer stopping");
                break;
            }
            Some(resource_id) = hints.recv() => {
                inner.refresh_one(resource_id).await;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => inner.handle_notice(notice).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Lock observer lagged behind pool notices");
                    inner.refresh_all().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::warn!("Pool notice bus closed");
                    break;
                }
            },
            _ = retry.tick() => {
                inner.retry().await;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
