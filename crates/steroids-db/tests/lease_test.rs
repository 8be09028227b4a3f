//! Integration tests for workstream lease fencing.

use chrono::{Duration, Utc};
use uuid::Uuid;

use steroids_db::models::WorkstreamStatus;
use steroids_db::queries::workstreams;
use steroids_test_utils::create_global_store;

#[tokio::test]
async fn refresh_succeeds_for_owner_and_fails_for_stranger() {
    let store = create_global_store().await;
    let session = workstreams::insert_session(&store.pool, "/tmp/p", "integration")
        .await
        .unwrap();
    let ws = workstreams::insert_workstream(&store.pool, session.id, "/tmp/clone-0", 0, &[])
        .await
        .unwrap();

    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let now = Utc::now();

    // First refresh claims the unowned row.
    let rows = workstreams::refresh_lease(&store.pool, ws.id, 0, owner, now)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // The owner can keep refreshing.
    let rows = workstreams::refresh_lease(&store.pool, ws.id, 0, owner, now)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // A different runner with the same generation is rejected.
    let rows = workstreams::refresh_lease(&store.pool, ws.id, 0, stranger, now)
        .await
        .unwrap();
    assert_eq!(rows, 0, "two refreshes with different runners must not both succeed");
}

#[tokio::test]
async fn reclaim_bumps_generation_and_fences_old_owner() {
    let store = create_global_store().await;
    let session = workstreams::insert_session(&store.pool, "/tmp/p", "integration")
        .await
        .unwrap();
    let ws = workstreams::insert_workstream(&store.pool, session.id, "/tmp/clone-0", 0, &[])
        .await
        .unwrap();

    let old_owner = Uuid::new_v4();
    let new_owner = Uuid::new_v4();
    let now = Utc::now();

    workstreams::refresh_lease(&store.pool, ws.id, 0, old_owner, now)
        .await
        .unwrap();

    // Lease is live, so a reclaim is refused.
    let reclaimed = workstreams::reclaim_lease(&store.pool, ws.id, 0, new_owner, now)
        .await
        .unwrap();
    assert!(reclaimed.is_none());

    // Let the lease lapse; reclaim succeeds and bumps the generation.
    let later = now + Duration::seconds(121);
    let reclaimed = workstreams::reclaim_lease(&store.pool, ws.id, 0, new_owner, later)
        .await
        .unwrap()
        .expect("reclaim should succeed after expiry");
    assert_eq!(reclaimed.claim_generation, 1);
    assert_eq!(reclaimed.runner_id, Some(new_owner));

    // The old owner's refresh at the old generation is permanently fenced.
    let rows = workstreams::refresh_lease(&store.pool, ws.id, 0, old_owner, later)
        .await
        .unwrap();
    assert_eq!(rows, 0, "refresh after generation bump must fail");

    // And even at the new generation the old owner is not the holder.
    let rows = workstreams::refresh_lease(&store.pool, ws.id, 1, old_owner, later)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn refresh_fails_once_workstream_leaves_claimable_status() {
    let store = create_global_store().await;
    let session = workstreams::insert_session(&store.pool, "/tmp/p", "integration")
        .await
        .unwrap();
    let ws = workstreams::insert_workstream(&store.pool, session.id, "/tmp/clone-0", 0, &[])
        .await
        .unwrap();

    let owner = Uuid::new_v4();
    let now = Utc::now();
    workstreams::refresh_lease(&store.pool, ws.id, 0, owner, now)
        .await
        .unwrap();

    workstreams::set_workstream_status(&store.pool, ws.id, 0, WorkstreamStatus::BlockedConflict)
        .await
        .unwrap();

    let rows = workstreams::refresh_lease(&store.pool, ws.id, 0, owner, now)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn conflict_attempts_accumulate_and_clear() {
    let store = create_global_store().await;
    let session = workstreams::insert_session(&store.pool, "/tmp/p", "integration")
        .await
        .unwrap();
    let ws = workstreams::insert_workstream(&store.pool, session.id, "/tmp/clone-0", 0, &[])
        .await
        .unwrap();

    let retry_at = Utc::now() + Duration::minutes(1);
    for expected in 1..=3 {
        let attempts = workstreams::record_conflict_attempt(&store.pool, ws.id, retry_at)
            .await
            .unwrap();
        assert_eq!(attempts, expected);
    }

    workstreams::clear_conflict_state(&store.pool, ws.id).await.unwrap();
    let ws = workstreams::get_workstream(&store.pool, ws.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ws.conflict_attempts, 0);
    assert!(ws.next_retry_at.is_none());
}

#[tokio::test]
async fn workstreams_list_in_partition_order() {
    let store = create_global_store().await;
    let session = workstreams::insert_session(&store.pool, "/tmp/p", "integration")
        .await
        .unwrap();

    let late = workstreams::insert_workstream(&store.pool, session.id, "/tmp/clone-b", 7, &[])
        .await
        .unwrap();
    let early = workstreams::insert_workstream(&store.pool, session.id, "/tmp/clone-a", 2, &[])
        .await
        .unwrap();

    let listed = workstreams::list_for_session(&store.pool, session.id).await.unwrap();
    assert_eq!(
        listed.iter().map(|w| w.id).collect::<Vec<_>>(),
        vec![early.id, late.id]
    );
}
