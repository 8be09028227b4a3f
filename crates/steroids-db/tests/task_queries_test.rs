//! Integration tests for task queries: transactional transitions,
//! audit coupling, rejection bookkeeping, and task locks.

use chrono::{Duration, Utc};
use uuid::Uuid;

use steroids_db::models::{Actor, TaskStatus};
use steroids_db::queries::audit;
use steroids_db::queries::sections;
use steroids_db::queries::tasks::{self, RejectionDetails, TransitionExtras};
use steroids_test_utils::create_project_store;

async fn seed_task(pool: &sqlx::SqlitePool, title: &str) -> steroids_db::models::Task {
    let section_id = steroids_db::models::section_id("PLAN.md", "phase-1");
    sections::upsert_section(pool, &section_id, "phase-1", 0, 50, Some("PLAN.md"))
        .await
        .unwrap();
    tasks::insert_task(pool, title, Some(&section_id), 0, 50, Some("PLAN.md"), None)
        .await
        .unwrap()
}

#[tokio::test]
async fn transition_writes_audit_atomically() {
    let store = create_project_store().await;
    let task = seed_task(&store.pool, "add parser").await;

    let rows = tasks::transition_task(
        &store.pool,
        task.id,
        TaskStatus::Pending,
        TaskStatus::InProgress,
        Actor::Coder,
        TransitionExtras::default(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let entries = audit::list_audit_for_task(&store.pool, task.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].from_status, TaskStatus::Pending);
    assert_eq!(entries[0].to_status, TaskStatus::InProgress);
    assert_eq!(entries[0].actor, Actor::Coder);
}

#[tokio::test]
async fn transition_with_wrong_from_is_a_noop() {
    let store = create_project_store().await;
    let task = seed_task(&store.pool, "add parser").await;

    let rows = tasks::transition_task(
        &store.pool,
        task.id,
        TaskStatus::Review,
        TaskStatus::Completed,
        Actor::Orchestrator,
        TransitionExtras::default(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);

    // No audit entry was written either.
    let entries = audit::list_audit_for_task(&store.pool, task.id).await.unwrap();
    assert!(entries.is_empty());

    let unchanged = tasks::get_task(&store.pool, task.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, TaskStatus::Pending);
}

#[tokio::test]
async fn rejection_increments_counter_and_numbers_rows() {
    let store = create_project_store().await;
    let task = seed_task(&store.pool, "add parser").await;

    tasks::transition_task(
        &store.pool,
        task.id,
        TaskStatus::Pending,
        TaskStatus::InProgress,
        Actor::Coder,
        TransitionExtras::default(),
    )
    .await
    .unwrap();

    for n in 1..=3 {
        tasks::transition_task(
            &store.pool,
            task.id,
            TaskStatus::InProgress,
            TaskStatus::Review,
            Actor::Coder,
            TransitionExtras::default(),
        )
        .await
        .unwrap();

        let rows = tasks::transition_task(
            &store.pool,
            task.id,
            TaskStatus::Review,
            TaskStatus::InProgress,
            Actor::Reviewer,
            TransitionExtras {
                rejection: Some(RejectionDetails {
                    notes: "tests missing",
                    reviewer_provider: "claude",
                    reviewer_model: "test-model",
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(rows, 1, "rejection {n} should apply");
    }

    let updated = tasks::get_task(&store.pool, task.id).await.unwrap().unwrap();
    assert_eq!(updated.rejection_count, 3);

    let rejections = audit::list_rejections_for_task(&store.pool, task.id)
        .await
        .unwrap();
    assert_eq!(rejections.len(), 3);
    assert_eq!(
        rejections.iter().map(|r| r.rejection_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn rejection_count_check_constraint_holds() {
    let store = create_project_store().await;
    let task = seed_task(&store.pool, "add parser").await;

    // Force rejection_count to the cap, then try to exceed it directly.
    sqlx::query("UPDATE tasks SET rejection_count = 15 WHERE id = $1")
        .bind(task.id)
        .execute(&store.pool)
        .await
        .unwrap();

    let result = sqlx::query("UPDATE tasks SET rejection_count = 16 WHERE id = $1")
        .bind(task.id)
        .execute(&store.pool)
        .await;
    assert!(result.is_err(), "check constraint should reject 16");
}

#[tokio::test]
async fn task_lock_blocks_and_expires() {
    let store = create_project_store().await;
    let task = seed_task(&store.pool, "add parser").await;
    let runner_a = Uuid::new_v4();
    let runner_b = Uuid::new_v4();
    let now = Utc::now();

    // A takes the lock.
    let got = tasks::acquire_task_lock(&store.pool, task.id, runner_a, now + Duration::minutes(2))
        .await
        .unwrap();
    assert!(got);

    // B cannot take it while unexpired.
    let got = tasks::acquire_task_lock(&store.pool, task.id, runner_b, now + Duration::minutes(2))
        .await
        .unwrap();
    assert!(!got, "unexpired lock must not be stolen");

    // A can re-acquire (refresh) its own lock.
    let got = tasks::acquire_task_lock(&store.pool, task.id, runner_a, now + Duration::minutes(4))
        .await
        .unwrap();
    assert!(got);

    // Expire the lock, then B can steal it.
    sqlx::query("UPDATE task_locks SET expires_at = $1 WHERE task_id = $2")
        .bind(now - Duration::minutes(1))
        .bind(task.id)
        .execute(&store.pool)
        .await
        .unwrap();

    let got = tasks::acquire_task_lock(&store.pool, task.id, runner_b, now + Duration::minutes(2))
        .await
        .unwrap();
    assert!(got, "expired lock should be stealable");

    let lock = tasks::get_task_lock(&store.pool, task.id).await.unwrap().unwrap();
    assert_eq!(lock.runner_id, runner_b);
}

#[tokio::test]
async fn next_eligible_respects_locks_and_dependencies() {
    let store = create_project_store().await;
    let now = Utc::now();

    let sec_a = steroids_db::models::section_id("PLAN.md", "a");
    let sec_b = steroids_db::models::section_id("PLAN.md", "b");
    sections::upsert_section(&store.pool, &sec_a, "a", 0, 50, Some("PLAN.md"))
        .await
        .unwrap();
    sections::upsert_section(&store.pool, &sec_b, "b", 1, 50, Some("PLAN.md"))
        .await
        .unwrap();
    sections::insert_dependency(&store.pool, &sec_b, &sec_a).await.unwrap();

    let task_a = tasks::insert_task(&store.pool, "a1", Some(&sec_a), 0, 50, None, None)
        .await
        .unwrap();
    let task_b = tasks::insert_task(&store.pool, "b1", Some(&sec_b), 0, 50, None, None)
        .await
        .unwrap();

    // Only a1 is eligible: section b depends on a.
    let picked = tasks::next_eligible_task(&store.pool, None, now).await.unwrap();
    assert_eq!(picked.unwrap().id, task_a.id);

    // Lock a1; nothing is eligible.
    tasks::acquire_task_lock(&store.pool, task_a.id, Uuid::new_v4(), now + Duration::minutes(2))
        .await
        .unwrap();
    let picked = tasks::next_eligible_task(&store.pool, None, now).await.unwrap();
    assert!(picked.is_none());

    // Complete a1 (and release the lock); b1 becomes eligible.
    tasks::clear_task_lock(&store.pool, task_a.id).await.unwrap();
    sqlx::query("UPDATE tasks SET status = 'completed' WHERE id = $1")
        .bind(task_a.id)
        .execute(&store.pool)
        .await
        .unwrap();

    let picked = tasks::next_eligible_task(&store.pool, None, now).await.unwrap();
    assert_eq!(picked.unwrap().id, task_b.id);
}

#[tokio::test]
async fn next_eligible_orders_by_priority_then_position() {
    let store = create_project_store().await;
    let now = Utc::now();

    let sec = steroids_db::models::section_id("PLAN.md", "only");
    sections::upsert_section(&store.pool, &sec, "only", 0, 50, Some("PLAN.md"))
        .await
        .unwrap();

    let _late = tasks::insert_task(&store.pool, "late", Some(&sec), 5, 50, None, None)
        .await
        .unwrap();
    let urgent = tasks::insert_task(&store.pool, "urgent", Some(&sec), 9, 10, None, None)
        .await
        .unwrap();
    let _early = tasks::insert_task(&store.pool, "early", Some(&sec), 1, 50, None, None)
        .await
        .unwrap();

    // Smaller priority number wins over position.
    let picked = tasks::next_eligible_task(&store.pool, None, now).await.unwrap();
    assert_eq!(picked.unwrap().id, urgent.id);
}

#[tokio::test]
async fn next_eligible_honors_section_filter() {
    let store = create_project_store().await;
    let now = Utc::now();

    let sec_a = steroids_db::models::section_id("PLAN.md", "a");
    let sec_b = steroids_db::models::section_id("PLAN.md", "b");
    sections::upsert_section(&store.pool, &sec_a, "a", 0, 50, None).await.unwrap();
    sections::upsert_section(&store.pool, &sec_b, "b", 1, 50, None).await.unwrap();

    tasks::insert_task(&store.pool, "a1", Some(&sec_a), 0, 50, None, None)
        .await
        .unwrap();
    let task_b = tasks::insert_task(&store.pool, "b1", Some(&sec_b), 0, 50, None, None)
        .await
        .unwrap();

    let filter = vec![sec_b.clone()];
    let picked = tasks::next_eligible_task(&store.pool, Some(&filter), now)
        .await
        .unwrap();
    assert_eq!(picked.unwrap().id, task_b.id);

    let picked = tasks::next_eligible_task(&store.pool, Some(&[]), now).await.unwrap();
    assert!(picked.is_none(), "empty filter matches nothing");
}
