//! Queries for the global `runners` table.
//!
//! The runners table is the process-wide coordination state; the
//! compare-and-set update is the only sanctioned mutation primitive for
//! rows that may be contended.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Runner, RunnerStatus};

/// Insert a new runner row.
pub async fn insert_runner(
    pool: &SqlitePool,
    id: Uuid,
    project_path: &str,
    pid: u32,
) -> Result<Runner> {
    let now = Utc::now();
    let runner = sqlx::query_as::<_, Runner>(
        "INSERT INTO runners (id, status, pid, project_path, started_at, heartbeat_at) \
         VALUES ($1, 'running', $2, $3, $4, $4) \
         RETURNING *",
    )
    .bind(id)
    .bind(pid as i64)
    .bind(project_path)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert runner")?;

    Ok(runner)
}

/// Fetch a runner by id.
pub async fn get_runner(pool: &SqlitePool, id: Uuid) -> Result<Option<Runner>> {
    let runner = sqlx::query_as::<_, Runner>("SELECT * FROM runners WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch runner")?;

    Ok(runner)
}

/// Refresh a runner's heartbeat. Fails silently (0 rows) once the
/// runner is stopped, so a late heartbeat cannot resurrect it.
pub async fn touch_heartbeat(pool: &SqlitePool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runners SET heartbeat_at = $1 WHERE id = $2 AND status != 'stopped'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to touch runner heartbeat")?;

    Ok(result.rows_affected())
}

/// Update a runner's status.
pub async fn set_runner_status(pool: &SqlitePool, id: Uuid, status: RunnerStatus) -> Result<()> {
    sqlx::query("UPDATE runners SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set runner status")?;

    Ok(())
}

/// Record which task a runner is currently executing (or clear it).
pub async fn set_current_task(
    pool: &SqlitePool,
    id: Uuid,
    task_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query("UPDATE runners SET current_task_id = $1 WHERE id = $2")
        .bind(task_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set runner current task")?;

    Ok(())
}

/// List runners for a project whose row still looks live: not stopped
/// and heartbeat within `stale_after`. PID liveness is probed by the
/// caller, which owns process inspection.
pub async fn list_live_runners_for_project(
    pool: &SqlitePool,
    project_path: &str,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<Vec<Runner>> {
    let cutoff = now - stale_after;
    let runners = sqlx::query_as::<_, Runner>(
        "SELECT * FROM runners \
         WHERE project_path = $1 AND status != 'stopped' AND heartbeat_at > $2",
    )
    .bind(project_path)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list live runners")?;

    Ok(runners)
}

/// List all non-stopped runner rows (for stuck detection, which needs
/// stale rows too).
pub async fn list_open_runners(pool: &SqlitePool) -> Result<Vec<Runner>> {
    let runners =
        sqlx::query_as::<_, Runner>("SELECT * FROM runners WHERE status != 'stopped'")
            .fetch_all(pool)
            .await
            .context("failed to list open runners")?;

    Ok(runners)
}

/// Count runner rows that still look live across all projects (the
/// global `max_concurrent` cap).
pub async fn count_live_runners(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<i64> {
    let cutoff = now - stale_after;
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runners WHERE status != 'stopped' AND heartbeat_at > $1",
    )
    .bind(cutoff)
    .fetch_one(pool)
    .await
    .context("failed to count live runners")?;

    Ok(count)
}

/// Delete runner rows whose heartbeat is older than the stale cutoff or
/// that are already stopped. Returns the deleted rows.
pub async fn delete_stale_runners(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<Vec<Runner>> {
    let cutoff = now - stale_after;
    let runners = sqlx::query_as::<_, Runner>(
        "DELETE FROM runners \
         WHERE status = 'stopped' OR heartbeat_at <= $1 \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to delete stale runners")?;

    Ok(runners)
}

/// Delete a single runner row.
pub async fn delete_runner(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM runners WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete runner")?;

    Ok(result.rows_affected() > 0)
}
