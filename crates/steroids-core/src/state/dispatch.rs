//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use anyhow::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

use steroids_db::models::{Actor, TaskStatus};
use steroids_db::queries::audit;

use super::{RejectOutcome, TaskStateMachine};

/// Coder picks the task up: `pending -> in_progress`.
pub async fn begin_coding(pool: &SqlitePool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Pending,
        TaskStatus::InProgress,
        Actor::Coder,
        None,
    )
    .await
}

/// Coder submits for review: `in_progress -> review`, recording the
/// submission note when one was produced.
pub async fn submit_for_review(
    pool: &SqlitePool,
    task_id: Uuid,
    note: Option<&str>,
) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::InProgress,
        TaskStatus::Review,
        Actor::Coder,
        None,
    )
    .await?;

    if let Some(note) = note {
        audit::insert_submission_note(pool, task_id, note).await?;
    }
    Ok(())
}

/// Coder skips the task: `in_progress -> skipped`.
pub async fn skip_by_coder(pool: &SqlitePool, task_id: Uuid, notes: Option<&str>) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::InProgress,
        TaskStatus::Skipped,
        Actor::Coder,
        notes,
    )
    .await
}

/// Reviewer approves: `review -> completed`.
pub async fn approve(pool: &SqlitePool, task_id: Uuid, notes: Option<&str>) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Review,
        TaskStatus::Completed,
        Actor::Reviewer,
        notes,
    )
    .await
}

/// Reviewer rejects: `review -> in_progress` plus a rejection entry,
/// or `review -> disputed` at the cap.
pub async fn reject(
    pool: &SqlitePool,
    task_id: Uuid,
    notes: &str,
    reviewer_provider: &str,
    reviewer_model: &str,
) -> Result<RejectOutcome> {
    TaskStateMachine::reject(pool, task_id, notes, reviewer_provider, reviewer_model).await
}

/// Reviewer disputes: `review -> disputed`.
pub async fn dispute(pool: &SqlitePool, task_id: Uuid, notes: Option<&str>) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Review,
        TaskStatus::Disputed,
        Actor::Reviewer,
        notes,
    )
    .await
}

/// Reviewer skips: `review -> skipped`.
pub async fn skip_by_reviewer(pool: &SqlitePool, task_id: Uuid, notes: Option<&str>) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Review,
        TaskStatus::Skipped,
        Actor::Reviewer,
        notes,
    )
    .await
}

/// Runner failure handling: `in_progress -> failed` with a note.
pub async fn mark_failed(pool: &SqlitePool, task_id: Uuid, notes: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::InProgress,
        TaskStatus::Failed,
        Actor::Orchestrator,
        Some(notes),
    )
    .await
}

/// Operator force-transition to `pending`, `failed`, or `skipped`.
pub async fn force(
    pool: &SqlitePool,
    task_id: Uuid,
    to: TaskStatus,
    notes: Option<&str>,
) -> Result<()> {
    TaskStateMachine::force(pool, task_id, to, notes).await
}
