//! Repository for the `live_stream_schedules` table.
//!
//! Every lock transition is a single guarded `UPDATE ... RETURNING`, so the
//! guard and the write are atomic with respect to other writers.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use realtyops_core::schedule::{ScheduleRow, ScheduleStatus};
use realtyops_core::store::{
    EditingChange, Guard, HoldChange, ScheduleQuery, SchedulePatch, ScheduleStore, StatusChange,
    StoreError, UpdateOutcome,
};
use realtyops_core::types::DbId;

use crate::models::schedule::{CreateSchedule, ScheduleRecord};

/// Column list for `live_stream_schedules` queries.
const COLUMNS: &str = "id, status, created_by, participant_ids, editing_by, editing_at, \
                       editing_expires_at, pre_edit_status, lock_type, lock_reason, lock_end_time, \
                       created_at, updated_at";

// ---------------------------------------------------------------------------
// ScheduleRepo
// ---------------------------------------------------------------------------

/// Provides queries and guarded updates for schedule slots.
pub struct ScheduleRepo;

impl ScheduleRepo {
    /// Insert a new slot, defaulting to `available`.
    pub async fn create(pool: &PgPool, input: &CreateSchedule) -> Result<ScheduleRecord, sqlx::Error> {
        let status = input.status.unwrap_or(ScheduleStatus::Available);
        let query = format!(
            "INSERT INTO live_stream_schedules (status, created_by, participant_ids) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ScheduleRecord>(&query)
            .bind(status.as_str())
            .bind(input.created_by)
            .bind(&input.participant_ids)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<ScheduleRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM live_stream_schedules WHERE id = $1");
        sqlx::query_as::<_, ScheduleRecord>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List slots matching `filter`, ordered by id.
    pub async fn list(pool: &PgPool, filter: &ScheduleQuery) -> Result<Vec<ScheduleRecord>, sqlx::Error> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM live_stream_schedules WHERE TRUE"));

        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if !filter.ids.is_empty() {
            qb.push(" AND id = ANY(").push_bind(filter.ids.clone()).push(")");
        }
        qb.push(" ORDER BY id");

        qb.build_query_as::<ScheduleRecord>().fetch_all(pool).await
    }

    /// Apply `patch` to slot `id` only where `guard` holds.
    ///
    /// Returns the updated row, or `None` when the guard did not match (or
    /// the row does not exist).
    pub async fn update_where(
        pool: &PgPool,
        id: DbId,
        patch: &SchedulePatch,
        guard: &Guard,
    ) -> Result<Option<ScheduleRecord>, sqlx::Error> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE live_stream_schedules SET updated_at = NOW()");

        push_patch(&mut qb, patch);

        qb.push(" WHERE id = ").push_bind(id).push(" AND ");
        push_guard(&mut qb, guard);
        qb.push(format!(" RETURNING {COLUMNS}"));

        qb.build_query_as::<ScheduleRecord>()
            .fetch_optional(pool)
            .await
    }
}

fn push_patch(qb: &mut QueryBuilder<'_, Postgres>, patch: &SchedulePatch) {
    match &patch.status {
        Some(StatusChange::Set(status)) => {
            qb.push(", status = ").push_bind(status.as_str());
        }
        Some(StatusChange::ResetUnlessBooked) => {
            qb.push(
                ", status = CASE WHEN status = 'booked' OR pre_edit_status = 'booked' \
                 THEN 'booked' ELSE 'available' END",
            );
        }
        None => {}
    }

    match &patch.editing {
        Some(EditingChange::Begin {
            holder,
            at,
            expires_at,
        }) => {
            // SET expressions see the pre-update row.
            qb.push(", pre_edit_status = CASE WHEN status = 'editing' THEN pre_edit_status ELSE status END");
            qb.push(", editing_by = ").push_bind(*holder);
            qb.push(", editing_at = ").push_bind(*at);
            qb.push(", editing_expires_at = ").push_bind(*expires_at);
        }
        Some(EditingChange::ExtendTo(expires_at)) => {
            qb.push(", editing_expires_at = ").push_bind(*expires_at);
        }
        Some(EditingChange::Clear) => {
            qb.push(
                ", editing_by = NULL, editing_at = NULL, editing_expires_at = NULL, \
                 pre_edit_status = NULL",
            );
        }
        None => {}
    }

    match &patch.hold {
        Some(HoldChange::Place {
            lock_type,
            reason,
            end_time,
        }) => {
            qb.push(", lock_type = ").push_bind(lock_type.as_str());
            qb.push(", lock_reason = ").push_bind(reason.clone());
            qb.push(", lock_end_time = ").push_bind(*end_time);
        }
        Some(HoldChange::Lift) => {
            qb.push(", lock_type = 'none', lock_reason = NULL, lock_end_time = NULL");
        }
        None => {}
    }
}

fn push_guard(qb: &mut QueryBuilder<'_, Postgres>, guard: &Guard) {
    match guard {
        Guard::Claimable { now } => {
            qb.push(
                "(status IN ('available', 'booked') OR (status = 'editing' AND \
                 (editing_by IS NULL OR editing_expires_at IS NULL OR editing_expires_at <= ",
            )
            .push_bind(*now)
            .push(")))");
        }
        Guard::HeldBy(holder) => {
            qb.push("editing_by = ").push_bind(*holder);
        }
        Guard::Holdable { now } => {
            qb.push(
                "status <> 'booked' AND pre_edit_status IS DISTINCT FROM 'booked' \
                 AND NOT (status = 'editing' AND editing_by IS NOT NULL \
                 AND editing_expires_at IS NOT NULL AND editing_expires_at > ",
            )
            .push_bind(*now)
            .push(")");
        }
        Guard::Status(status) => {
            qb.push("status = ").push_bind(status.as_str());
        }
        Guard::Always => {
            qb.push("TRUE");
        }
    }
}

// ---------------------------------------------------------------------------
// PgScheduleStore
// ---------------------------------------------------------------------------

/// `ScheduleStore` backed by Postgres.
#[derive(Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    tracing::error!(error = %err, "Schedule store query failed");
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn update_where(
        &self,
        id: DbId,
        patch: &SchedulePatch,
        guard: &Guard,
    ) -> Result<UpdateOutcome, StoreError> {
        match ScheduleRepo::update_where(&self.pool, id, patch, guard)
            .await
            .map_err(backend)?
        {
            Some(record) => Ok(UpdateOutcome::applied(record.into_row()?)),
            None => Ok(UpdateOutcome::unmatched()),
        }
    }

    async fn select_where(&self, query: &ScheduleQuery) -> Result<Vec<ScheduleRow>, StoreError> {
        ScheduleRepo::list(&self.pool, query)
            .await
            .map_err(backend)?
            .into_iter()
            .map(ScheduleRecord::into_row)
            .collect()
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<ScheduleRow>, StoreError> {
        ScheduleRepo::find_by_id(&self.pool, id)
            .await
            .map_err(backend)?
            .map(ScheduleRecord::into_row)
            .transpose()
    }
}
