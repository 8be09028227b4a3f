//! Integration tests for stuck-task classification and recovery.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use steroids_core::config::HealthConfig;
use steroids_core::health::run_health_pass;
use steroids_core::hooks::RecordingSink;
use steroids_db::models::{FailureMode, TaskStatus};
use steroids_db::queries::{incidents, runners as runner_db, sections, tasks};
use steroids_test_utils::{create_global_store, create_project_store};

async fn seed_task(pool: &sqlx::SqlitePool, status: &str, updated_minutes_ago: i64) -> Uuid {
    let section = steroids_db::models::section_id("PLAN.md", "s");
    sections::upsert_section(pool, &section, "s", 0, 50, None).await.unwrap();
    let task = tasks::insert_task(pool, "stuck work", Some(&section), 0, 50, None, None)
        .await
        .unwrap();
    sqlx::query("UPDATE tasks SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status)
        .bind(Utc::now() - Duration::minutes(updated_minutes_ago))
        .bind(task.id)
        .execute(pool)
        .await
        .unwrap();
    task.id
}

/// An invocation row so the task does not read as a db inconsistency.
async fn seed_invocation(pool: &sqlx::SqlitePool, task_id: Uuid, role: &str, status: &str) {
    sqlx::query(
        "INSERT INTO invocations \
             (id, task_id, role, provider, model, prompt, started_at_ms, \
              last_activity_at_ms, status) \
         VALUES ($1, $2, $3, 'claude', 'm', 'p', $4, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(task_id)
    .bind(role)
    .bind((Utc::now() - Duration::minutes(45)).timestamp_millis())
    .bind(status)
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn orphaned_task_is_reset_to_pending_with_incident() {
    let project = create_project_store().await;
    let global = create_global_store().await;
    let sink = Arc::new(RecordingSink::new());

    let task_id = seed_task(&project.pool, "in_progress", 30).await;
    // A completed invocation exists (so no db_inconsistency) but none
    // running, and no runner anywhere.
    seed_invocation(&project.pool, task_id, "coder", "completed").await;
    tasks::acquire_task_lock(&project.pool, task_id, Uuid::new_v4(), Utc::now() + Duration::hours(1))
        .await
        .unwrap();

    let outcome = run_health_pass(
        &project.pool,
        &global.pool,
        "/p",
        &HealthConfig::default(),
        sink.as_ref(),
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.findings[0].mode, FailureMode::OrphanedTask);

    let task = tasks::get_task(&project.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.failure_count, 1);
    assert!(tasks::get_task_lock(&project.pool, task_id).await.unwrap().is_none());

    let open = incidents::list_open(&project.pool).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].failure_mode, FailureMode::OrphanedTask);
    assert!(sink.names().contains(&"health.changed"));
}

#[tokio::test]
async fn stale_task_with_running_invocation_is_not_orphaned() {
    let project = create_project_store().await;
    let global = create_global_store().await;
    let sink = RecordingSink::new();

    let task_id = seed_task(&project.pool, "in_progress", 30).await;
    seed_invocation(&project.pool, task_id, "coder", "running").await;

    let outcome = run_health_pass(
        &project.pool,
        &global.pool,
        "/p",
        &HealthConfig::default(),
        &sink,
        Utc::now(),
    )
    .await
    .unwrap();

    assert!(
        outcome.findings.is_empty(),
        "running invocation without a runner is left for the next pass"
    );
}

#[tokio::test]
async fn hanging_invocation_when_live_runner_holds_a_silent_task() {
    let project = create_project_store().await;
    let global = create_global_store().await;
    let sink = RecordingSink::new();

    // Activity 40 minutes old, past the 30-minute coder budget.
    let task_id = seed_task(&project.pool, "in_progress", 40).await;
    seed_invocation(&project.pool, task_id, "coder", "running").await;

    // A live runner (our own pid, fresh heartbeat) executing this task.
    let runner = runner_db::insert_runner(&global.pool, Uuid::new_v4(), "/p", std::process::id())
        .await
        .unwrap();
    runner_db::set_current_task(&global.pool, runner.id, Some(task_id))
        .await
        .unwrap();

    let mut config = HealthConfig::default();
    // Keep recovery from killing our own test process.
    config.auto_recover = false;

    let outcome = run_health_pass(
        &project.pool,
        &global.pool,
        "/p",
        &config,
        &sink,
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.findings.len(), 1);
    let finding = &outcome.findings[0];
    assert_eq!(finding.mode, FailureMode::HangingInvocation);
    assert_eq!(finding.task_id, Some(task_id));
    assert_eq!(finding.runner_id, Some(runner.id));
    assert_eq!(finding.details["phase"], "coder");
}

#[tokio::test]
async fn dead_runner_is_removed_and_task_recovered() {
    let project = create_project_store().await;
    let global = create_global_store().await;
    let sink = RecordingSink::new();

    let task_id = seed_task(&project.pool, "in_progress", 30).await;
    seed_invocation(&project.pool, task_id, "coder", "completed").await;

    // Runner row with a pid that cannot exist; heartbeat fresh, which
    // must not save it.
    let runner = runner_db::insert_runner(&global.pool, Uuid::new_v4(), "/p", 0x7fff_fff0)
        .await
        .unwrap();
    runner_db::set_current_task(&global.pool, runner.id, Some(task_id))
        .await
        .unwrap();

    let outcome = run_health_pass(
        &project.pool,
        &global.pool,
        "/p",
        &HealthConfig::default(),
        &sink,
        Utc::now(),
    )
    .await
    .unwrap();

    // Exclusivity: one finding covers the runner and its held task.
    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.findings[0].mode, FailureMode::DeadRunner);

    assert!(runner_db::get_runner(&global.pool, runner.id).await.unwrap().is_none());
    let task = tasks::get_task(&project.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending, "held task got the hanging treatment");
}

#[tokio::test]
async fn zombie_runner_has_stale_heartbeat_but_live_pid() {
    let project = create_project_store().await;
    let global = create_global_store().await;
    let sink = RecordingSink::new();

    let runner = runner_db::insert_runner(&global.pool, Uuid::new_v4(), "/p", std::process::id())
        .await
        .unwrap();
    sqlx::query("UPDATE runners SET heartbeat_at = $1 WHERE id = $2")
        .bind(Utc::now() - Duration::minutes(10))
        .bind(runner.id)
        .execute(&global.pool)
        .await
        .unwrap();

    let mut config = HealthConfig::default();
    config.auto_recover = false; // classification only; do not kill us

    let outcome = run_health_pass(
        &project.pool,
        &global.pool,
        "/p",
        &config,
        &sink,
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.findings[0].mode, FailureMode::ZombieRunner);
}

#[tokio::test]
async fn db_inconsistency_is_reported_but_not_recovered() {
    let project = create_project_store().await;
    let global = create_global_store().await;
    let sink = RecordingSink::new();

    // Recently active in_progress task with zero invocation records.
    let task_id = seed_task(&project.pool, "in_progress", 5).await;

    let outcome = run_health_pass(
        &project.pool,
        &global.pool,
        "/p",
        &HealthConfig::default(),
        &sink,
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.findings[0].mode, FailureMode::DbInconsistency);
    assert!(outcome.recovered_actions.is_empty());

    // Reported: the incident exists; the task is untouched.
    let task = tasks::get_task(&project.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    let open = incidents::list_open(&project.pool).await.unwrap();
    assert_eq!(open.len(), 1);
}

#[tokio::test]
async fn hourly_incident_cap_skips_recovery() {
    let project = create_project_store().await;
    let global = create_global_store().await;
    let sink = RecordingSink::new();

    // Fill the hourly budget.
    for _ in 0..10 {
        incidents::insert_incident(
            &project.pool,
            None,
            None,
            FailureMode::OrphanedTask,
            &serde_json::json!({}),
        )
        .await
        .unwrap();
    }

    let task_id = seed_task(&project.pool, "in_progress", 30).await;
    seed_invocation(&project.pool, task_id, "coder", "completed").await;

    let outcome = run_health_pass(
        &project.pool,
        &global.pool,
        "/p",
        &HealthConfig::default(),
        &sink,
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.skipped_due_to_safety_limit, 1);
    assert!(outcome.recovered_actions.is_empty());

    // The task was left alone.
    let task = tasks::get_task(&project.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
}

#[tokio::test]
async fn auto_recover_disabled_records_incident_only() {
    let project = create_project_store().await;
    let global = create_global_store().await;
    let sink = RecordingSink::new();

    let task_id = seed_task(&project.pool, "in_progress", 30).await;
    seed_invocation(&project.pool, task_id, "coder", "completed").await;

    let mut config = HealthConfig::default();
    config.auto_recover = false;

    let outcome = run_health_pass(
        &project.pool,
        &global.pool,
        "/p",
        &config,
        &sink,
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.findings.len(), 1);
    assert!(outcome.recovered_actions.is_empty());

    let task = tasks::get_task(&project.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    let open = incidents::list_open(&project.pool).await.unwrap();
    assert_eq!(open.len(), 1);
}
