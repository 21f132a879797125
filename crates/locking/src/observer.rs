//! Read side of the lock protocol.
//!
//! A [`LockObserver`] keeps a [`LockBoard`]: the latest known copy of every
//! lock-relevant schedule row. The push observer refreshes rows when change
//! notifications arrive; the polling observer refetches the whole candidate
//! set on a fixed interval. Both answer the same questions ("is this slot
//! locked by someone else", "who holds it until when") with read-time expiry
//! applied.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use realtyops_core::clock::SharedClock;
use realtyops_core::schedule::{HoldInfo, LockInfo, ScheduleRow};
use realtyops_core::store::{ScheduleQuery, ScheduleStore, StoreError};
use realtyops_core::types::{DbId, Timestamp};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::LockError;

const CHANGE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverMode {
    Push,
    Polling,
}

impl fmt::Display for ObserverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObserverMode::Push => "push",
            ObserverMode::Polling => "polling",
        })
    }
}

/// What changed on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardChange {
    Updated { resource_id: DbId },
    Removed { resource_id: DbId },
    /// The whole candidate set was refetched and differed from the last one.
    Refreshed { rows: usize },
    Connectivity { connected: bool },
}

// ---------------------------------------------------------------------------
// LockBoard
// ---------------------------------------------------------------------------

struct Observed {
    row: ScheduleRow,
    seen_at: Timestamp,
}

/// Latest observed copy of each lock-relevant row.
pub struct LockBoard {
    rows: Mutex<HashMap<DbId, Observed>>,
    connected: AtomicBool,
    changes: broadcast::Sender<BoardChange>,
}

impl Default for LockBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl LockBoard {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            rows: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            changes,
        }
    }

    /// Subscribe to board changes.
    pub fn watch(&self) -> broadcast::Receiver<BoardChange> {
        self.changes.subscribe()
    }

    /// Replace the board with a freshly fetched snapshot. Returns `true` and
    /// notifies watchers only if the rows differ from the previous snapshot.
    pub fn replace_all(&self, rows: Vec<ScheduleRow>, now: Timestamp) -> bool {
        let count = rows.len();
        let changed = {
            let mut current = self.rows();
            let changed = current.len() != rows.len()
                || rows
                    .iter()
                    .any(|r| current.get(&r.id).map(|o| &o.row) != Some(r));
            *current = rows
                .into_iter()
                .map(|row| (row.id, Observed { row, seen_at: now }))
                .collect();
            changed
        };
        if changed {
            self.publish(BoardChange::Refreshed { rows: count });
        }
        changed
    }

    /// Store one freshly read row. Returns `true` if it differed.
    pub fn upsert(&self, row: ScheduleRow, now: Timestamp) -> bool {
        let resource_id = row.id;
        let changed = {
            let mut rows = self.rows();
            let changed = rows.get(&resource_id).map(|o| &o.row) != Some(&row);
            rows.insert(resource_id, Observed { row, seen_at: now });
            changed
        };
        if changed {
            self.publish(BoardChange::Updated { resource_id });
        }
        changed
    }

    pub fn remove(&self, resource_id: DbId) -> bool {
        let removed = self.rows().remove(&resource_id).is_some();
        if removed {
            self.publish(BoardChange::Removed { resource_id });
        }
        removed
    }

    /// Forget the cached copy so the next read goes to the store.
    pub fn invalidate(&self, resource_id: DbId) {
        self.rows().remove(&resource_id);
    }

    pub fn get(&self, resource_id: DbId) -> Option<ScheduleRow> {
        self.rows().get(&resource_id).map(|o| o.row.clone())
    }

    /// The cached row if it was seen no longer than `staleness` ago.
    pub fn get_fresh(&self, resource_id: DbId, now: Timestamp, staleness: chrono::Duration) -> Option<ScheduleRow> {
        self.rows()
            .get(&resource_id)
            .filter(|o| now - o.seen_at <= staleness)
            .map(|o| o.row.clone())
    }

    pub fn rows_snapshot(&self) -> Vec<ScheduleRow> {
        let mut rows: Vec<ScheduleRow> = self.rows().values().map(|o| o.row.clone()).collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    /// Update the connectivity indicator. Returns `true` if it flipped.
    pub fn set_connected(&self, connected: bool) -> bool {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            tracing::info!(connected, "Lock board connectivity changed");
            self.publish(BoardChange::Connectivity { connected });
        }
        was != connected
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, change: BoardChange) {
        // No watchers is fine.
        let _ = self.changes.send(change);
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<DbId, Observed>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// RowSource
// ---------------------------------------------------------------------------

/// Reads rows through the board, falling back to the store.
#[derive(Clone)]
pub struct RowSource {
    pub store: Arc<dyn ScheduleStore>,
    pub clock: SharedClock,
    pub board: Arc<LockBoard>,
    pub staleness: chrono::Duration,
}

impl RowSource {
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// The row, from the board if fresh enough, else from the store.
    pub async fn read(&self, resource_id: DbId) -> Result<Option<ScheduleRow>, LockError> {
        if let Some(row) = self.board.get_fresh(resource_id, self.now(), self.staleness) {
            return Ok(Some(row));
        }
        self.refresh(resource_id).await
    }

    /// Read the row from the store and record it on the board.
    pub async fn refresh(&self, resource_id: DbId) -> Result<Option<ScheduleRow>, LockError> {
        let row = self.store.find_by_id(resource_id).await?;
        match &row {
            Some(row) => {
                self.board.upsert(row.clone(), self.now());
            }
            None => {
                self.board.remove(resource_id);
            }
        }
        Ok(row)
    }

    pub async fn fetch_candidates(&self) -> Result<Vec<ScheduleRow>, StoreError> {
        self.store.select_where(&ScheduleQuery::lock_candidates()).await
    }
}

// ---------------------------------------------------------------------------
// LockObserver
// ---------------------------------------------------------------------------

/// Observes lock state on schedule slots.
#[async_trait]
pub trait LockObserver: Send + Sync + 'static {
    fn mode(&self) -> ObserverMode;

    /// Begin observing. Fails if the observer cannot reach its source.
    async fn start(&self) -> Result<(), LockError>;

    async fn stop(&self);

    /// Connectivity indicator for the UI.
    fn is_connected(&self) -> bool;

    fn rows(&self) -> &RowSource;

    fn board(&self) -> &LockBoard {
        &self.rows().board
    }

    async fn row(&self, resource_id: DbId) -> Result<Option<ScheduleRow>, LockError> {
        self.rows().read(resource_id).await
    }

    async fn is_locked_by_other(&self, resource_id: DbId, me: DbId) -> Result<bool, LockError> {
        let row = self.row(resource_id).await?;
        let now = self.rows().now();
        Ok(row.is_some_and(|r| r.is_locked_by_other(me, now)))
    }

    async fn lock_info(&self, resource_id: DbId) -> Result<Option<LockInfo>, LockError> {
        let row = self.row(resource_id).await?;
        let now = self.rows().now();
        Ok(row.and_then(|r| r.lock_info(now)))
    }

    async fn hold_info(&self, resource_id: DbId) -> Result<Option<HoldInfo>, LockError> {
        Ok(self.row(resource_id).await?.and_then(|r| r.hold_info()))
    }
}
