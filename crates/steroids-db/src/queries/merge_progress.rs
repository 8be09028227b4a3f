//! Queries for the `merge_progress` checkpoint table.
//!
//! One row per `(session, workstream, position)`; upserts are
//! last-writer-wins because only the merge-lock holder writes them.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{MergeItemStatus, MergeProgress};

/// Record (or overwrite) the checkpoint for one commit position.
pub async fn upsert_progress(
    pool: &SqlitePool,
    session_id: Uuid,
    workstream_id: Uuid,
    position: i64,
    commit_sha: &str,
    status: MergeItemStatus,
    conflict_task_id: Option<Uuid>,
    applied_commit_sha: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO merge_progress \
             (session_id, workstream_id, position, commit_sha, status, \
              conflict_task_id, applied_commit_sha) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (session_id, workstream_id, position) DO UPDATE SET \
             commit_sha = excluded.commit_sha, \
             status = excluded.status, \
             conflict_task_id = excluded.conflict_task_id, \
             applied_commit_sha = excluded.applied_commit_sha",
    )
    .bind(session_id)
    .bind(workstream_id)
    .bind(position)
    .bind(commit_sha)
    .bind(status)
    .bind(conflict_task_id)
    .bind(applied_commit_sha)
    .execute(pool)
    .await
    .context("failed to upsert merge progress")?;

    Ok(())
}

/// Fetch the checkpoint for one position, if recorded.
pub async fn get_progress(
    pool: &SqlitePool,
    session_id: Uuid,
    workstream_id: Uuid,
    position: i64,
) -> Result<Option<MergeProgress>> {
    let progress = sqlx::query_as::<_, MergeProgress>(
        "SELECT * FROM merge_progress \
         WHERE session_id = $1 AND workstream_id = $2 AND position = $3",
    )
    .bind(session_id)
    .bind(workstream_id)
    .bind(position)
    .fetch_optional(pool)
    .await
    .context("failed to fetch merge progress")?;

    Ok(progress)
}

/// All checkpoints for a workstream, in commit order.
pub async fn list_for_workstream(
    pool: &SqlitePool,
    session_id: Uuid,
    workstream_id: Uuid,
) -> Result<Vec<MergeProgress>> {
    let rows = sqlx::query_as::<_, MergeProgress>(
        "SELECT * FROM merge_progress \
         WHERE session_id = $1 AND workstream_id = $2 \
         ORDER BY position ASC",
    )
    .bind(session_id)
    .bind(workstream_id)
    .fetch_all(pool)
    .await
    .context("failed to list merge progress")?;

    Ok(rows)
}
