//! Lease-based edit locks over guarded row updates.
//!
//! The lock *is* the row: `acquire` moves a slot to `editing` with a holder
//! and a deadline, `extend` pushes the deadline out, `release` clears the
//! editing columns. Every step is a conditional update against the
//! [`ScheduleStore`]; zero matched rows means someone else got there first.
//!
//! [`EditLockManager`] also keeps the *local lock set*: the slots this
//! process believes it holds, each with an auto-release timer of one lease.
//! The set is never trusted on its own. A failed extend or a contradicting
//! observation drops the entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use realtyops_core::clock::SharedClock;
use realtyops_core::schedule::{
    check_edit_permission, EditPermission, HoldInfo, HoldType, LockInfo, ScheduleRow, ScheduleStatus,
};
use realtyops_core::store::{Guard, SchedulePatch, ScheduleStore};
use realtyops_core::types::{DbId, Timestamp};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LockConfig;
use crate::error::LockError;
use crate::timers::{Expired, LeaseTimers};

const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Local lock set
// ---------------------------------------------------------------------------

/// A lease this process believes it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldLock {
    pub resource_id: DbId,
    pub holder: DbId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    /// Last time the store confirmed the lease (acquire or extend).
    pub confirmed_at: Timestamp,
}

impl HeldLock {
    fn info(&self) -> LockInfo {
        LockInfo {
            resource_id: self.resource_id,
            holder: self.holder,
            acquired_at: Some(self.acquired_at),
            expires_at: self.expires_at,
        }
    }
}

struct State {
    locks: HashMap<DbId, HeldLock>,
    timers: LeaseTimers,
    /// Bumped by every local release so in-flight acquires and extends can
    /// tell they lost the race.
    epochs: HashMap<DbId, u64>,
}

impl State {
    fn epoch(&self, id: DbId) -> u64 {
        self.epochs.get(&id).copied().unwrap_or(0)
    }

    fn drop_lock(&mut self, id: DbId) -> Option<HeldLock> {
        *self.epochs.entry(id).or_insert(0) += 1;
        self.timers.cancel(id);
        self.locks.remove(&id)
    }
}

/// Result of one pass of the extend loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtendReport {
    pub extended: Vec<DbId>,
    /// Leases the store no longer attributes to us.
    pub dropped: Vec<DbId>,
    /// Leases whose extend failed for another reason; kept until the timer fires.
    pub failed: Vec<DbId>,
}

// ---------------------------------------------------------------------------
// EditLockManager
// ---------------------------------------------------------------------------

struct Inner {
    store: Arc<dyn ScheduleStore>,
    clock: SharedClock,
    config: LockConfig,
    state: Mutex<State>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<Expired>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Acquire, extend, and release edit leases on schedule slots.
#[derive(Clone)]
pub struct EditLockManager {
    inner: Arc<Inner>,
}

impl EditLockManager {
    pub fn new(store: Arc<dyn ScheduleStore>, clock: SharedClock, config: LockConfig) -> Self {
        let (timers, expired_rx) = LeaseTimers::new();
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                config,
                state: Mutex::new(State {
                    locks: HashMap::new(),
                    timers,
                    epochs: HashMap::new(),
                }),
                expired_rx: Mutex::new(Some(expired_rx)),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    /// Spawn the background loop that auto-releases expired leases and, if
    /// enabled, extends held leases. Calling this twice is a no-op.
    pub fn start(&self) {
        let Some(expired_rx) = lock(&self.inner.expired_rx).take() else {
            return;
        };
        let handle = tokio::spawn(run(self.clone(), expired_rx, self.inner.cancel.child_token()));
        *lock(&self.inner.task) = Some(handle);
    }

    /// Stop the background loop and release every held lease.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down edit lock manager");
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();

        let task = lock(&self.inner.task).take();
        if let Some(handle) = task {
            let _ = tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, handle).await;
        }

        let released = self.release_all().await;
        tracing::info!(released, "Edit lock manager shut down complete");
    }

    // ---- local lock set ----

    /// Slots in the local lock set.
    pub fn held(&self) -> Vec<HeldLock> {
        let mut held: Vec<HeldLock> = self.state().locks.values().cloned().collect();
        held.sort_by_key(|l| l.resource_id);
        held
    }

    pub fn held_lock(&self, resource_id: DbId) -> Option<HeldLock> {
        self.state().locks.get(&resource_id).cloned()
    }

    /// `true` if the local lock set has `resource_id` for `holder`.
    pub fn holds(&self, resource_id: DbId, holder: DbId) -> bool {
        self.state()
            .locks
            .get(&resource_id)
            .is_some_and(|l| l.holder == holder)
    }

    /// Time before the auto-release timer for `resource_id` fires.
    pub fn time_to_auto_release(&self, resource_id: DbId) -> Option<Duration> {
        self.state().timers.remaining(resource_id)
    }

    // ---- protocol ----

    /// Take the edit lease on a slot.
    ///
    /// Acquiring a slot the caller already holds refreshes the lease.
    pub async fn acquire(&self, resource_id: DbId, holder: DbId) -> Result<LockInfo, LockError> {
        self.ensure_running()?;
        let now = self.now();

        let current = self
            .inner
            .store
            .find_by_id(resource_id)
            .await?
            .ok_or(LockError::NotFound(resource_id))?;

        if current.live_holder(now) == Some(holder) {
            return self.extend(resource_id, holder).await;
        }
        if let EditPermission::Denied { reason } = check_edit_permission(Some(&current), holder, now) {
            return Err(contention(&current, now, reason));
        }

        let epoch = self.state().epoch(resource_id);
        let expires_at = now + self.inner.config.lease_chrono();
        let outcome = self
            .inner
            .store
            .update_where(
                resource_id,
                &SchedulePatch::begin_editing(holder, now, expires_at),
                &Guard::Claimable { now },
            )
            .await?;

        if !outcome.is_applied() {
            let row = self
                .inner
                .store
                .find_by_id(resource_id)
                .await?
                .ok_or(LockError::NotFound(resource_id))?;
            tracing::info!(resource_id, holder, "Edit lock contended");
            return Err(contention(
                &row,
                now,
                format!("Schedule {resource_id} changed while acquiring, please try again"),
            ));
        }

        let held = HeldLock {
            resource_id,
            holder,
            acquired_at: now,
            expires_at,
            confirmed_at: now,
        };
        let info = held.info();

        let recorded = {
            let mut st = self.state();
            if st.epoch(resource_id) == epoch {
                st.locks.insert(resource_id, held);
                st.timers.arm(resource_id, self.inner.config.lease);
                true
            } else {
                false
            }
        };

        if recorded {
            tracing::info!(resource_id, holder, expires_at = %expires_at, "Edit lock acquired");
        } else {
            tracing::debug!(resource_id, holder, "Release raced acquire; lease left to expire");
        }
        Ok(info)
    }

    /// Push the lease deadline out by one lease and reset the timer.
    ///
    /// If the store no longer attributes the lease to `holder` the slot is
    /// dropped from the local lock set and `NotHolder` is returned.
    pub async fn extend(&self, resource_id: DbId, holder: DbId) -> Result<LockInfo, LockError> {
        self.ensure_running()?;
        let now = self.now();
        let expires_at = now + self.inner.config.lease_chrono();
        let epoch = self.state().epoch(resource_id);

        let outcome = self
            .inner
            .store
            .update_where(resource_id, &SchedulePatch::extend_lease(expires_at), &Guard::HeldBy(holder))
            .await?;

        if !outcome.is_applied() {
            let dropped = {
                let mut st = self.state();
                let ours = st.locks.get(&resource_id).is_some_and(|l| l.holder == holder);
                ours && st.drop_lock(resource_id).is_some()
            };
            tracing::warn!(resource_id, holder, dropped, "Extend rejected; lease no longer ours");
            return Err(LockError::NotHolder {
                resource_id,
                holder,
            });
        }

        let acquired_at = outcome
            .row
            .as_ref()
            .and_then(|r| r.editing_at)
            .unwrap_or(now);
        let mut st = self.state();
        if st.epoch(resource_id) != epoch {
            return Ok(LockInfo {
                resource_id,
                holder,
                acquired_at: Some(acquired_at),
                expires_at,
            });
        }
        let entry = st.locks.entry(resource_id).or_insert_with(|| HeldLock {
            resource_id,
            holder,
            acquired_at,
            expires_at,
            confirmed_at: now,
        });
        entry.expires_at = expires_at;
        entry.confirmed_at = now;
        let info = entry.info();
        st.timers.arm(resource_id, self.inner.config.lease);
        drop(st);

        tracing::debug!(resource_id, holder, expires_at = %expires_at, "Edit lock extended");
        Ok(info)
    }

    /// Give up a lease.
    ///
    /// The slot becomes `final_status` if given, else the status it had
    /// before it was acquired if that was `booked`, else `available` unless
    /// the row has meanwhile become `booked`. Returns `false` if the slot was
    /// not in the local lock set; nothing is written in that case.
    pub async fn release(
        &self,
        resource_id: DbId,
        holder: DbId,
        final_status: Option<ScheduleStatus>,
    ) -> Result<bool, LockError> {
        if let Some(status) = final_status {
            if !status.is_valid_release_target() {
                return Err(LockError::Invalid(format!(
                    "Cannot release schedule {resource_id} to '{status}'"
                )));
            }
        }

        {
            let mut st = self.state();
            match st.locks.get(&resource_id).map(|l| l.holder) {
                None => {
                    tracing::debug!(resource_id, holder, "Release for lock not held locally");
                    return Ok(false);
                }
                Some(owner) if owner != holder => {
                    return Err(LockError::NotHolder {
                        resource_id,
                        holder,
                    });
                }
                Some(_) => {
                    st.drop_lock(resource_id);
                }
            }
        }

        self.write_release(resource_id, holder, final_status).await?;
        Ok(true)
    }

    /// Put a slot under an administrative hold.
    pub async fn hold(
        &self,
        resource_id: DbId,
        lock_type: HoldType,
        reason: Option<String>,
        end_time: Option<Timestamp>,
    ) -> Result<HoldInfo, LockError> {
        self.ensure_running()?;
        if lock_type == HoldType::None {
            return Err(LockError::Invalid("A hold needs a lock type other than 'none'".into()));
        }
        let now = self.now();

        let outcome = self
            .inner
            .store
            .update_where(
                resource_id,
                &SchedulePatch::place_hold(lock_type, reason, end_time),
                &Guard::Holdable { now },
            )
            .await?;

        match outcome.row.filter(|_| outcome.matched > 0) {
            Some(row) => {
                tracing::info!(resource_id, %lock_type, "Schedule held");
                row.hold_info().ok_or_else(|| {
                    LockError::Invalid(format!("Schedule {resource_id} did not read back as held"))
                })
            }
            None => {
                let row = self
                    .inner
                    .store
                    .find_by_id(resource_id)
                    .await?
                    .ok_or(LockError::NotFound(resource_id))?;
                Err(contention(&row, now, format!("Schedule {resource_id} cannot be held")))
            }
        }
    }

    /// Lift an administrative hold. Returns `false` if the slot was not held.
    pub async fn unhold(&self, resource_id: DbId) -> Result<bool, LockError> {
        self.ensure_running()?;
        let outcome = self
            .inner
            .store
            .update_where(
                resource_id,
                &SchedulePatch::lift_hold(),
                &Guard::Status(ScheduleStatus::Locked),
            )
            .await?;

        if outcome.is_applied() {
            tracing::info!(resource_id, "Schedule hold lifted");
            return Ok(true);
        }
        match self.inner.store.find_by_id(resource_id).await? {
            Some(_) => Ok(false),
            None => Err(LockError::NotFound(resource_id)),
        }
    }

    // ---- maintenance ----

    /// Extend every lease in the local lock set.
    pub async fn extend_all(&self) -> ExtendReport {
        let held: Vec<(DbId, DbId)> = self
            .state()
            .locks
            .values()
            .map(|l| (l.resource_id, l.holder))
            .collect();

        let mut report = ExtendReport::default();
        for (resource_id, holder) in held {
            match self.extend(resource_id, holder).await {
                Ok(_) => report.extended.push(resource_id),
                Err(LockError::NotHolder { .. }) => report.dropped.push(resource_id),
                Err(e) => {
                    tracing::warn!(resource_id, holder, error = %e, "Extend failed; keeping lease until timeout");
                    report.failed.push(resource_id);
                }
            }
        }
        report
    }

    /// Release every lease in the local lock set.
    pub async fn release_all(&self) -> usize {
        let held: Vec<HeldLock> = {
            let mut st = self.state();
            let ids: Vec<DbId> = st.locks.keys().copied().collect();
            ids.into_iter().filter_map(|id| st.drop_lock(id)).collect()
        };

        let mut released = 0;
        for lock in held {
            match self.write_release(lock.resource_id, lock.holder, None).await {
                Ok(()) => released += 1,
                Err(e) => {
                    tracing::error!(resource_id = lock.resource_id, error = %e, "Failed to release lease");
                }
            }
        }
        released
    }

    /// Drop local entries that the observed rows contradict.
    ///
    /// An entry confirmed within the staleness window is only dropped if the
    /// row shows a different live holder; older entries are also dropped when
    /// the row shows no live lease at all.
    pub fn reconcile(&self, rows: &[ScheduleRow]) -> Vec<DbId> {
        let now = self.now();
        let staleness = self.inner.config.staleness_chrono();

        let mut dropped = Vec::new();
        let mut st = self.state();
        for row in rows {
            let Some(held) = st.locks.get(&row.id) else {
                continue;
            };
            let observed = row.live_holder(now);
            if observed == Some(held.holder) {
                continue;
            }
            if observed.is_none() && now - held.confirmed_at < staleness {
                continue;
            }
            st.drop_lock(row.id);
            dropped.push(row.id);
        }
        drop(st);

        for id in &dropped {
            tracing::warn!(resource_id = *id, "Observed row contradicts local lease; dropped");
        }
        dropped
    }

    // ---- private helpers ----

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    fn ensure_running(&self) -> Result<(), LockError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            Err(LockError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn write_release(
        &self,
        resource_id: DbId,
        holder: DbId,
        final_status: Option<ScheduleStatus>,
    ) -> Result<(), LockError> {
        let outcome = self
            .inner
            .store
            .update_where(
                resource_id,
                &SchedulePatch::end_editing(final_status),
                &Guard::HeldBy(holder),
            )
            .await?;

        if outcome.is_applied() {
            let status = outcome.row.map(|r| r.status.as_str()).unwrap_or("unknown");
            tracing::info!(resource_id, holder, status, "Edit lock released");
        } else {
            tracing::debug!(resource_id, holder, "Release matched no row; lease already gone");
        }
        Ok(())
    }

    async fn on_expired(&self, expired: Expired) {
        let held = {
            let mut st = self.state();
            if !st.timers.take_if_current(expired) {
                return;
            }
            let held = st.locks.remove(&expired.resource_id);
            *st.epochs.entry(expired.resource_id).or_insert(0) += 1;
            held
        };
        let Some(held) = held else {
            return;
        };

        tracing::warn!(
            resource_id = held.resource_id,
            holder = held.holder,
            "Edit lease timed out; auto-releasing"
        );
        if let Err(e) = self.write_release(held.resource_id, held.holder, None).await {
            tracing::error!(resource_id = held.resource_id, error = %e, "Auto-release failed");
        }
    }
}

/// Turn a rejected claim into the most specific error for `row`.
fn contention(row: &ScheduleRow, now: Timestamp, fallback: String) -> LockError {
    if let Some(info) = row.lock_info(now) {
        return LockError::AlreadyLocked {
            resource_id: row.id,
            held_by: info.holder,
            expires_at: info.expires_at,
        };
    }
    if let Some(hold) = row.hold_info() {
        return LockError::Held {
            resource_id: row.id,
            lock_type: hold.lock_type,
            reason: hold.reason,
        };
    }
    match row.effective_status(now) {
        status @ (ScheduleStatus::Completed | ScheduleStatus::Cancelled) => LockError::NotEditable {
            resource_id: row.id,
            status,
        },
        _ => LockError::Denied(fallback),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // No user code runs under these locks; a poisoned guard still holds
    // consistent data.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Auto-release expired leases and run the extend loop until cancelled.
async fn run(manager: EditLockManager, mut expired_rx: mpsc::UnboundedReceiver<Expired>, cancel: CancellationToken) {
    let config = manager.config().clone();
    tracing::info!(
        lease_secs = config.lease.as_secs(),
        extend_interval_secs = config.extend_interval.as_secs(),
        auto_extend = config.auto_extend,
        "Edit lock loop started"
    );

    let mut interval = tokio::time::interval(config.extend_interval);
    // The first tick completes immediately; nothing is held yet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Edit lock loop stopping");
                break;
            }
            Some(expired) = expired_rx.recv() => {
                manager.on_expired(expired).await;
            }
            _ = interval.tick(), if config.auto_extend => {
                let report = manager.extend_all().await;
                if !report.dropped.is_empty() || !report.failed.is_empty() {
                    tracing::info!(
                        extended = report.extended.len(),
                        dropped = report.dropped.len(),
                        failed = report.failed.len(),
                        "Extend pass finished with losses"
                    );
                }
            }
        }
    }
}
