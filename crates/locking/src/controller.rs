//! One entry point for the lock protocol plus whichever observer is running.

use std::sync::Arc;

use realtyops_core::schedule::{check_edit_permission, EditPermission, HoldInfo, HoldType, LockInfo, ScheduleRow, ScheduleStatus};
use realtyops_core::types::{DbId, Timestamp};
use realtyops_realtime::RealtimeManager;
use serde::Serialize;

use crate::error::LockError;
use crate::observer::{LockBoard, LockObserver, ObserverMode, RowSource};
use crate::polling::PollingLockObserver;
use crate::protocol::{EditLockManager, HeldLock};
use crate::push::PushLockObserver;

/// Serializable summary of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub mode: ObserverMode,
    pub connected: bool,
    pub held: Vec<HeldLock>,
    pub observed_rows: usize,
}

/// Writes go through the [`EditLockManager`]; reads go through the observer
/// board with read-time expiry.
#[derive(Clone)]
pub struct LockController {
    manager: EditLockManager,
    observer: Arc<dyn LockObserver>,
}

impl LockController {
    pub fn new(manager: EditLockManager, observer: Arc<dyn LockObserver>) -> Self {
        Self { manager, observer }
    }

    /// Start `manager` with a push observer when `realtime` is enabled and
    /// subscribing works, otherwise with a polling observer.
    pub async fn connect(
        manager: EditLockManager,
        realtime: Option<&RealtimeManager>,
        subscriber_id: &str,
    ) -> Self {
        let config = manager.config().clone();
        let rows = RowSource {
            store: Arc::clone(manager.store()),
            clock: Arc::clone(manager.clock()),
            board: Arc::new(LockBoard::new()),
            staleness: config.staleness_chrono(),
        };

        let observer: Arc<dyn LockObserver> = match realtime.filter(|rt| rt.is_enabled()) {
            Some(rt) => {
                let push = PushLockObserver::new(rt.clone(), rows.clone(), subscriber_id, config.poll_interval)
                    .with_reconciler(manager.clone());
                match push.start().await {
                    Ok(()) => Arc::new(push),
                    Err(e) => {
                        tracing::warn!(error = %e, "Realtime unavailable, falling back to polling");
                        Self::start_polling(&manager, rows).await
                    }
                }
            }
            None => Self::start_polling(&manager, rows).await,
        };

        manager.start();
        tracing::info!(mode = %observer.mode(), "Lock controller started");
        Self { manager, observer }
    }

    async fn start_polling(manager: &EditLockManager, rows: RowSource) -> Arc<dyn LockObserver> {
        let polling = PollingLockObserver::new(rows, manager.config().poll_interval).with_reconciler(manager.clone());
        // Polling never refuses to start; a failed first poll is retried.
        let _ = polling.start().await;
        Arc::new(polling)
    }

    pub fn manager(&self) -> &EditLockManager {
        &self.manager
    }

    pub fn observer(&self) -> &Arc<dyn LockObserver> {
        &self.observer
    }

    pub fn board(&self) -> &LockBoard {
        self.observer.board()
    }

    pub fn mode(&self) -> ObserverMode {
        self.observer.mode()
    }

    pub fn is_connected(&self) -> bool {
        self.observer.is_connected()
    }

    pub fn status(&self) -> LockStatus {
        LockStatus {
            mode: self.observer.mode(),
            connected: self.observer.is_connected(),
            held: self.manager.held(),
            observed_rows: self.observer.board().len(),
        }
    }

    // ---- writes ----

    pub async fn acquire(&self, resource_id: DbId, holder: DbId) -> Result<LockInfo, LockError> {
        let result = self.manager.acquire(resource_id, holder).await;
        self.board().invalidate(resource_id);
        result
    }

    pub async fn extend(&self, resource_id: DbId, holder: DbId) -> Result<LockInfo, LockError> {
        let result = self.manager.extend(resource_id, holder).await;
        self.board().invalidate(resource_id);
        result
    }

    pub async fn release(
        &self,
        resource_id: DbId,
        holder: DbId,
        final_status: Option<ScheduleStatus>,
    ) -> Result<bool, LockError> {
        let result = self.manager.release(resource_id, holder, final_status).await;
        self.board().invalidate(resource_id);
        result
    }

    pub async fn hold(
        &self,
        resource_id: DbId,
        lock_type: HoldType,
        reason: Option<String>,
        end_time: Option<Timestamp>,
    ) -> Result<HoldInfo, LockError> {
        let result = self.manager.hold(resource_id, lock_type, reason, end_time).await;
        self.board().invalidate(resource_id);
        result
    }

    pub async fn unhold(&self, resource_id: DbId) -> Result<bool, LockError> {
        let result = self.manager.unhold(resource_id).await;
        self.board().invalidate(resource_id);
        result
    }

    // ---- reads ----

    pub async fn row(&self, resource_id: DbId) -> Result<Option<ScheduleRow>, LockError> {
        self.observer.row(resource_id).await
    }

    pub async fn is_locked_by_other(&self, resource_id: DbId, me: DbId) -> Result<bool, LockError> {
        self.observer.is_locked_by_other(resource_id, me).await
    }

    pub async fn lock_info(&self, resource_id: DbId) -> Result<Option<LockInfo>, LockError> {
        self.observer.lock_info(resource_id).await
    }

    pub async fn hold_info(&self, resource_id: DbId) -> Result<Option<HoldInfo>, LockError> {
        self.observer.hold_info(resource_id).await
    }

    pub async fn edit_permission(&self, resource_id: DbId, me: DbId) -> Result<EditPermission, LockError> {
        let row = self.observer.row(resource_id).await?;
        Ok(check_edit_permission(row.as_ref(), me, self.observer.rows().now()))
    }

    /// Stop observing, then release every held lease.
    pub async fn shutdown(&self) {
        self.observer.stop().await;
        self.manager.shutdown().await;
    }
}
