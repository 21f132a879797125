//! Lock observer that refetches the candidate set on a fixed interval.
//!
//! Used when the realtime pool cannot give us a subscription. Each poll
//! replaces the whole board; watchers hear about it only when something
//! actually changed. A run of failed polls flips the connectivity indicator
//! but never stops the loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;
use crate::observer::{LockObserver, ObserverMode, RowSource};
use crate::protocol::EditLockManager;

/// Consecutive failed polls before the board is marked disconnected.
pub const DISCONNECT_AFTER_FAILURES: u32 = 3;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    rows: RowSource,
    reconciler: Option<EditLockManager>,
    interval: Duration,
    failures: AtomicU32,
}

pub struct PollingLockObserver {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingLockObserver {
    pub fn new(rows: RowSource, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                rows,
                reconciler: None,
                interval,
                failures: AtomicU32::new(0),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Reconcile `manager`'s local lock set on every poll.
    pub fn with_reconciler(mut self, manager: EditLockManager) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reconciler = Some(manager);
        }
        self
    }

    /// Run one poll now.
    pub async fn poll_now(&self) -> Result<bool, LockError> {
        self.inner.poll().await
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.failures.load(Ordering::SeqCst)
    }
}

impl Inner {
    /// Fetch and apply one snapshot. Returns `true` if the board changed.
    async fn poll(&self) -> Result<bool, LockError> {
        match self.rows.fetch_candidates().await {
            Ok(rows) => {
                self.failures.store(0, Ordering::SeqCst);
                self.rows.board.set_connected(true);
                if let Some(manager) = &self.reconciler {
                    manager.reconcile(&rows);
                }
                Ok(self.rows.board.replace_all(rows, self.rows.now()))
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= DISCONNECT_AFTER_FAILURES {
                    self.rows.board.set_connected(false);
                }
                tracing::warn!(failures, error = %e, "Lock poll failed");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl LockObserver for PollingLockObserver {
    fn mode(&self) -> ObserverMode {
        ObserverMode::Polling
    }

    async fn start(&self) -> Result<(), LockError> {
        if lock(&self.task).is_some() {
            return Ok(());
        }
        // A failed first poll is retried by the loop.
        let _ = self.inner.poll().await;

        let handle = tokio::spawn(run(Arc::clone(&self.inner), self.cancel.child_token()));
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(handle) = task {
            let _ = tokio::time::timeout(STOP_TIMEOUT, handle).await;
        }
        self.inner.rows.board.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        self.inner.rows.board.is_connected()
    }

    fn rows(&self) -> &RowSource {
        &self.inner.rows
    }
}

async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    tracing::info!(interval_secs = inner.interval.as_secs(), "Lock polling started");
    let mut interval = tokio::time::interval(inner.interval);
    // The first tick completes immediately; `start` already polled.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Lock polling stopping");
                break;
            }
            _ = interval.tick() => {
                // Failures are logged and counted inside `poll`.
                let _ = inner.poll().await;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
