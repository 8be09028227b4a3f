//! Queries for `audit_log`, `rejections`, and `submission_notes`.
//!
//! Audit entries are only ever inserted through
//! [`super::tasks::transition_task`]; this module reads them back.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{AuditEntry, RejectionEntry, SubmissionNote};

/// List a task's audit trail in transition order.
pub async fn list_audit_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit_log WHERE task_id = $1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list audit entries")?;

    Ok(entries)
}

/// Full rejection history for a task, oldest first.
pub async fn list_rejections_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Vec<RejectionEntry>> {
    let entries = sqlx::query_as::<_, RejectionEntry>(
        "SELECT * FROM rejections WHERE task_id = $1 ORDER BY rejection_number ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list rejections")?;

    Ok(entries)
}

/// Record a coder submission note.
pub async fn insert_submission_note(
    pool: &SqlitePool,
    task_id: Uuid,
    notes: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO submission_notes (task_id, notes, created_at) VALUES ($1, $2, $3)",
    )
    .bind(task_id)
    .bind(notes)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to insert submission note")?;

    Ok(())
}

/// Most recent submission note for a task, if any.
pub async fn latest_submission_note(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Option<SubmissionNote>> {
    let note = sqlx::query_as::<_, SubmissionNote>(
        "SELECT * FROM submission_notes WHERE task_id = $1 ORDER BY id DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest submission note")?;

    Ok(note)
}
