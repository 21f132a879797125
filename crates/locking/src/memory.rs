//! In-process [`ScheduleStore`].
//!
//! Rows live in a `BTreeMap` behind a mutex; guards and patches are
//! evaluated with the same rules the Postgres store compiles to SQL. When
//! wired to a [`LocalPushSource`], every applied write is emitted as a
//! change event, which makes the whole push path testable without a
//! database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use realtyops_core::clock::SharedClock;
use realtyops_core::schedule::{ScheduleRow, SCHEDULES_TABLE};
use realtyops_core::store::{Guard, SchedulePatch, ScheduleQuery, ScheduleStore, StoreError, UpdateOutcome};
use realtyops_core::types::DbId;
use realtyops_realtime::memory::LocalPushSource;
use realtyops_realtime::ChangeEvent;

#[derive(Default)]
pub struct InMemoryScheduleStore {
    rows: Mutex<BTreeMap<DbId, ScheduleRow>>,
    next_id: AtomicI64,
    push: Option<(LocalPushSource, SharedClock)>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit every applied write to `source`, stamped with `clock`.
    pub fn with_push(mut self, source: LocalPushSource, clock: SharedClock) -> Self {
        self.push = Some((source, clock));
        self
    }

    /// Insert a new available slot and return its id.
    pub fn create_available(&self) -> DbId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.put(ScheduleRow::available(id));
        id
    }

    /// Insert or overwrite a row as-is.
    pub fn put(&self, row: ScheduleRow) {
        let id = row.id;
        self.next_id.fetch_max(id, Ordering::SeqCst);
        self.rows().insert(id, row);
    }

    pub fn get(&self, id: DbId) -> Option<ScheduleRow> {
        self.rows().get(&id).cloned()
    }

    /// Make every call fail with a backend error until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Applied updates so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<DbId, ScheduleRow>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn update_where(
        &self,
        id: DbId,
        patch: &SchedulePatch,
        guard: &Guard,
    ) -> Result<UpdateOutcome, StoreError> {
        self.check_available()?;

        let (old, new) = {
            let mut rows = self.rows();
            let Some(row) = rows.get_mut(&id) else {
                return Ok(UpdateOutcome::unmatched());
            };
            if !guard.matches(row) {
                return Ok(UpdateOutcome::unmatched());
            }
            let old = row.clone();
            patch.apply_to(row);
            (old, row.clone())
        };
        self.writes.fetch_add(1, Ordering::SeqCst);

        if let Some((source, clock)) = &self.push {
            match (serde_json::to_value(&new), serde_json::to_value(&old)) {
                (Ok(new_json), Ok(old_json)) => {
                    let event = ChangeEvent::update(SCHEDULES_TABLE, new_json, Some(old_json)).at(clock.now());
                    source.emit(event).await;
                }
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(schedule_id = id, error = %e, "Failed to encode change event");
                }
            }
        }
        Ok(UpdateOutcome::applied(new))
    }

    async fn select_where(&self, query: &ScheduleQuery) -> Result<Vec<ScheduleRow>, StoreError> {
        self.check_available()?;
        Ok(self
            .rows()
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<ScheduleRow>, StoreError> {
        self.check_available()?;
        Ok(self.get(id))
    }
}
