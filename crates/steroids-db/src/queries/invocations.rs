//! Queries for the `invocations` table.
//!
//! Unlike the rest of the schema, invocation timestamps are millisecond
//! integers: `last_activity_at_ms` is bumped on every output chunk and
//! is the ground truth for stuck detection.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Invocation, InvocationMode, InvocationStatus, ProviderRole};

/// Parameters for starting an invocation record.
#[derive(Debug, Clone)]
pub struct NewInvocation<'a> {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub role: ProviderRole,
    pub provider: &'a str,
    pub model: &'a str,
    pub prompt: &'a str,
    pub started_at_ms: i64,
    pub mode: InvocationMode,
    pub resumed_from_session_id: Option<&'a str>,
    pub rejection_number: Option<i64>,
}

/// Insert a `running` invocation row at invocation start.
pub async fn insert_invocation(pool: &SqlitePool, new: &NewInvocation<'_>) -> Result<()> {
    sqlx::query(
        "INSERT INTO invocations \
             (id, task_id, role, provider, model, prompt, started_at_ms, \
              last_activity_at_ms, status, invocation_mode, resumed_from_session_id, \
              rejection_number) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $7, 'running', $8, $9, $10)",
    )
    .bind(new.id)
    .bind(new.task_id)
    .bind(new.role)
    .bind(new.provider)
    .bind(new.model)
    .bind(new.prompt)
    .bind(new.started_at_ms)
    .bind(new.mode)
    .bind(new.resumed_from_session_id)
    .bind(new.rejection_number)
    .execute(pool)
    .await
    .context("failed to insert invocation")?;

    Ok(())
}

/// Bump `last_activity_at_ms` for a running invocation.
pub async fn touch_activity(pool: &SqlitePool, id: Uuid, at_ms: i64) -> Result<()> {
    sqlx::query(
        "UPDATE invocations SET last_activity_at_ms = $1 \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(at_ms)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to touch invocation activity")?;

    Ok(())
}

/// Terminal fields written when an invocation finishes.
#[derive(Debug, Clone)]
pub struct InvocationCompletion<'a> {
    pub status: InvocationStatus,
    pub completed_at_ms: i64,
    pub exit_code: Option<i64>,
    pub duration_ms: i64,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub success: bool,
    pub timed_out: bool,
    pub session_id: Option<&'a str>,
    pub token_usage: Option<&'a str>,
}

/// Move a running invocation to a terminal status.
pub async fn complete_invocation(
    pool: &SqlitePool,
    id: Uuid,
    completion: &InvocationCompletion<'_>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE invocations SET \
             status = $1, completed_at_ms = $2, exit_code = $3, duration_ms = $4, \
             stdout = $5, stderr = $6, success = $7, timed_out = $8, \
             session_id = $9, token_usage = $10 \
         WHERE id = $11 AND status = 'running'",
    )
    .bind(completion.status)
    .bind(completion.completed_at_ms)
    .bind(completion.exit_code)
    .bind(completion.duration_ms)
    .bind(completion.stdout)
    .bind(completion.stderr)
    .bind(completion.success)
    .bind(completion.timed_out)
    .bind(completion.session_id)
    .bind(completion.token_usage)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to complete invocation")?;

    Ok(result.rows_affected())
}

/// All invocations for a task, newest first.
pub async fn list_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Invocation>> {
    let invocations = sqlx::query_as::<_, Invocation>(
        "SELECT * FROM invocations WHERE task_id = $1 ORDER BY started_at_ms DESC, id DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list invocations for task")?;

    Ok(invocations)
}

/// Latest reusable session id for `(task, role, provider, model)`: the
/// most recent completed invocation that reported one.
pub async fn find_resumable_session(
    pool: &SqlitePool,
    task_id: Uuid,
    role: ProviderRole,
    provider: &str,
    model: &str,
) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT session_id FROM invocations \
         WHERE task_id = $1 AND role = $2 AND provider = $3 AND model = $4 \
           AND status = 'completed' AND session_id IS NOT NULL \
         ORDER BY started_at_ms DESC LIMIT 1",
    )
    .bind(task_id)
    .bind(role)
    .bind(provider)
    .bind(model)
    .fetch_optional(pool)
    .await
    .context("failed to find resumable session")?;

    Ok(row.map(|(s,)| s))
}

/// Running invocations for a task in a given role.
pub async fn list_running_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
    role: ProviderRole,
) -> Result<Vec<Invocation>> {
    let invocations = sqlx::query_as::<_, Invocation>(
        "SELECT * FROM invocations \
         WHERE task_id = $1 AND role = $2 AND status = 'running'",
    )
    .bind(task_id)
    .bind(role)
    .fetch_all(pool)
    .await
    .context("failed to list running invocations")?;

    Ok(invocations)
}

/// Count invocation records of any status for a task (the
/// db-inconsistency probe).
pub async fn count_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM invocations WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .context("failed to count invocations")?;

    Ok(count)
}

/// Most recent activity timestamp across a task's invocations.
pub async fn latest_activity_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Option<i64>> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT MAX(last_activity_at_ms) FROM invocations WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to read latest invocation activity")?;

    Ok(row.0)
}
