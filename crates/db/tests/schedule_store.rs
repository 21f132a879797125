//! Integration tests for the Postgres schedule store.
//!
//! Exercises guarded updates against a real database:
//! - acquire on available and stale rows, contention on live leases
//! - extend and release guarded by holder
//! - release keeps `booked`, also after a lapsed lease is taken over
//! - racing acquires through the lock manager
//! - administrative hold and lift

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use realtyops_core::clock::{SharedClock, SystemClock};
use realtyops_core::schedule::{HoldType, ScheduleStatus};
use realtyops_core::store::{Guard, ScheduleQuery, SchedulePatch, ScheduleStore};
use realtyops_db::models::schedule::CreateSchedule;
use realtyops_db::repositories::{PgScheduleStore, ScheduleRepo};
use realtyops_locking::{EditLockManager, LockConfig, LockError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn new_slot(pool: &PgPool, status: Option<ScheduleStatus>) -> i64 {
    let input = CreateSchedule {
        status,
        created_by: Some(1),
        participant_ids: vec![2, 3],
    };
    ScheduleRepo::create(pool, &input).await.unwrap().id
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn health_check_passes(pool: PgPool) {
    realtyops_db::health_check(&pool).await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn created_slot_reads_back(pool: PgPool) {
    let id = new_slot(&pool, None).await;
    let store = PgScheduleStore::new(pool);

    let row = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, ScheduleStatus::Available);
    assert_eq!(row.participant_ids, vec![2, 3]);
    assert_eq!(row.lock_type, HoldType::None);
}

// ---------------------------------------------------------------------------
// Lease transitions
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn acquire_then_contend(pool: PgPool) {
    let id = new_slot(&pool, None).await;
    let store = PgScheduleStore::new(pool);
    let now = Utc::now();

    let first = store
        .update_where(
            id,
            &SchedulePatch::begin_editing(10, now, now + Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap();
    assert_eq!(first.matched, 1);
    assert_eq!(first.row.unwrap().editing_by, Some(10));

    let second = store
        .update_where(
            id,
            &SchedulePatch::begin_editing(11, now, now + Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap();
    assert_eq!(second.matched, 0);

    let row = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.editing_by, Some(10));
}

#[sqlx::test(migrations = "./migrations")]
async fn stale_lease_is_claimable(pool: PgPool) {
    let id = new_slot(&pool, None).await;
    let store = PgScheduleStore::new(pool);
    let then = Utc::now() - Duration::minutes(10);

    store
        .update_where(
            id,
            &SchedulePatch::begin_editing(10, then, then + Duration::minutes(5)),
            &Guard::Always,
        )
        .await
        .unwrap();

    let now = Utc::now();
    let outcome = store
        .update_where(
            id,
            &SchedulePatch::begin_editing(11, now, now + Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap();
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.row.unwrap().editing_by, Some(11));
}

#[sqlx::test(migrations = "./migrations")]
async fn extend_requires_holder(pool: PgPool) {
    let id = new_slot(&pool, None).await;
    let store = PgScheduleStore::new(pool);
    let now = Utc::now();
    store
        .update_where(
            id,
            &SchedulePatch::begin_editing(10, now, now + Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap();

    let later = now + Duration::minutes(9);
    let by_other = store
        .update_where(id, &SchedulePatch::extend_lease(later), &Guard::HeldBy(11))
        .await
        .unwrap();
    assert_eq!(by_other.matched, 0);

    let by_holder = store
        .update_where(id, &SchedulePatch::extend_lease(later), &Guard::HeldBy(10))
        .await
        .unwrap();
    let row = by_holder.row.unwrap();
    assert_eq!(row.editing_expires_at.map(|t| t.timestamp()), Some(later.timestamp()));
}

#[sqlx::test(migrations = "./migrations")]
async fn release_resets_to_available(pool: PgPool) {
    let id = new_slot(&pool, None).await;
    let store = PgScheduleStore::new(pool);
    let now = Utc::now();
    store
        .update_where(
            id,
            &SchedulePatch::begin_editing(10, now, now + Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap();

    let released = store
        .update_where(id, &SchedulePatch::end_editing(None), &Guard::HeldBy(10))
        .await
        .unwrap();
    let row = released.row.unwrap();
    assert_eq!(row.status, ScheduleStatus::Available);
    assert_eq!(row.editing_by, None);
    assert_eq!(row.editing_expires_at, None);

    // Second release matches nothing.
    let again = store
        .update_where(id, &SchedulePatch::end_editing(None), &Guard::HeldBy(10))
        .await
        .unwrap();
    assert_eq!(again.matched, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn release_with_final_status_books(pool: PgPool) {
    let id = new_slot(&pool, None).await;
    let store = PgScheduleStore::new(pool);
    let now = Utc::now();
    store
        .update_where(
            id,
            &SchedulePatch::begin_editing(10, now, now + Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap();

    let released = store
        .update_where(
            id,
            &SchedulePatch::end_editing(Some(ScheduleStatus::Booked)),
            &Guard::HeldBy(10),
        )
        .await
        .unwrap();
    assert_eq!(released.row.unwrap().status, ScheduleStatus::Booked);
}

#[sqlx::test(migrations = "./migrations")]
async fn reset_unless_booked_keeps_booked(pool: PgPool) {
    let id = new_slot(&pool, Some(ScheduleStatus::Booked)).await;
    let store = PgScheduleStore::new(pool);

    let outcome = store
        .update_where(id, &SchedulePatch::end_editing(None), &Guard::Always)
        .await
        .unwrap();
    assert_eq!(outcome.row.unwrap().status, ScheduleStatus::Booked);
}

#[sqlx::test(migrations = "./migrations")]
async fn lapsed_edit_of_booking_stays_booked(pool: PgPool) {
    let id = new_slot(&pool, Some(ScheduleStatus::Booked)).await;
    let store = PgScheduleStore::new(pool);
    let now = Utc::now();

    // A lease that already lapsed, as left behind by a holder that died.
    let lapsed = store
        .update_where(
            id,
            &SchedulePatch::begin_editing(2, now - Duration::minutes(10), now - Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap()
        .row
        .unwrap();
    assert_eq!(lapsed.status, ScheduleStatus::Editing);
    assert_eq!(lapsed.pre_edit_status, Some(ScheduleStatus::Booked));
    assert_eq!(lapsed.effective_status(now), ScheduleStatus::Booked);

    let held = store
        .update_where(id, &SchedulePatch::place_hold(HoldType::Manual, None, None), &Guard::Holdable { now })
        .await
        .unwrap();
    assert_eq!(held.matched, 0);

    let taken = store
        .update_where(
            id,
            &SchedulePatch::begin_editing(3, now, now + Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap()
        .row
        .unwrap();
    assert_eq!(taken.pre_edit_status, Some(ScheduleStatus::Booked));

    let released = store
        .update_where(id, &SchedulePatch::end_editing(None), &Guard::HeldBy(3))
        .await
        .unwrap()
        .row
        .unwrap();
    assert_eq!(released.status, ScheduleStatus::Booked);
    assert_eq!(released.pre_edit_status, None);
}

#[sqlx::test(migrations = "./migrations")]
async fn racing_acquires_admit_one_holder(pool: PgPool) {
    let id = new_slot(&pool, None).await;
    let store = Arc::new(PgScheduleStore::new(pool));
    let clock: SharedClock = Arc::new(SystemClock);
    let alice = EditLockManager::new(store.clone(), clock.clone(), LockConfig::default());
    let bob = EditLockManager::new(store.clone(), clock, LockConfig::default());

    let (a, b) = tokio::join!(alice.acquire(id, 10), bob.acquire(id, 11));
    let winner = match (&a, &b) {
        (Ok(info), Err(_)) | (Err(_), Ok(info)) => info.holder,
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    let loser = if winner == 10 { b } else { a };
    assert_matches!(loser, Err(LockError::AlreadyLocked { held_by, .. }) if held_by == winner);

    let row = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.editing_by, Some(winner));
}

// ---------------------------------------------------------------------------
// Holds and queries
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn hold_and_lift(pool: PgPool) {
    let id = new_slot(&pool, None).await;
    let store = PgScheduleStore::new(pool);
    let now = Utc::now();

    let held = store
        .update_where(
            id,
            &SchedulePatch::place_hold(HoldType::Maintenance, Some("studio repair".into()), None),
            &Guard::Holdable { now },
        )
        .await
        .unwrap();
    let row = held.row.unwrap();
    assert_eq!(row.status, ScheduleStatus::Locked);
    assert_eq!(row.lock_type, HoldType::Maintenance);

    let claim = store
        .update_where(
            id,
            &SchedulePatch::begin_editing(10, now, now + Duration::minutes(5)),
            &Guard::Claimable { now },
        )
        .await
        .unwrap();
    assert_eq!(claim.matched, 0);

    let lifted = store
        .update_where(
            id,
            &SchedulePatch::lift_hold(),
            &Guard::Status(ScheduleStatus::Locked),
        )
        .await
        .unwrap();
    let row = lifted.row.unwrap();
    assert_eq!(row.status, ScheduleStatus::Available);
    assert_eq!(row.lock_type, HoldType::None);
    assert_eq!(row.lock_reason, None);
}

#[sqlx::test(migrations = "./migrations")]
async fn select_lock_candidates(pool: PgPool) {
    let a = new_slot(&pool, None).await;
    let _done = new_slot(&pool, Some(ScheduleStatus::Completed)).await;
    let c = new_slot(&pool, Some(ScheduleStatus::Booked)).await;
    let store = PgScheduleStore::new(pool);

    let rows = store
        .select_where(&ScheduleQuery::lock_candidates())
        .await
        .unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a, c]);

    let only_c = store
        .select_where(&ScheduleQuery::default().with_ids([c]))
        .await
        .unwrap();
    assert_eq!(only_c.len(), 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn missing_row_is_unmatched(pool: PgPool) {
    let store = PgScheduleStore::new(pool);
    let outcome = store
        .update_where(9999, &SchedulePatch::end_editing(None), &Guard::Always)
        .await
        .unwrap();
    assert_eq!(outcome.matched, 0);
    assert!(store.find_by_id(9999).await.unwrap().is_none());
}
