//! Queries for `parallel_sessions` and `workstreams` in the global
//! store.
//!
//! Workstream ownership is fence-based: every mutation carries the
//! expected `claim_generation` (and owner, where it matters) in its
//! WHERE clause. Reclaiming a dead lease bumps the generation, which
//! permanently invalidates the prior owner's refreshes.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{ParallelSession, Workstream, WorkstreamStatus};

/// Lease duration granted by a successful claim or refresh.
pub const LEASE_DURATION: Duration = Duration::seconds(120);

/// Create a parallel session.
pub async fn insert_session(
    pool: &SqlitePool,
    project_path: &str,
    integration_branch: &str,
) -> Result<ParallelSession> {
    let session = sqlx::query_as::<_, ParallelSession>(
        "INSERT INTO parallel_sessions (id, project_path, integration_branch, status, created_at) \
         VALUES ($1, $2, $3, 'pending', $4) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(project_path)
    .bind(integration_branch)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert parallel session")?;

    Ok(session)
}

/// Fetch a session by id.
pub async fn get_session(pool: &SqlitePool, id: Uuid) -> Result<Option<ParallelSession>> {
    let session =
        sqlx::query_as::<_, ParallelSession>("SELECT * FROM parallel_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch parallel session")?;

    Ok(session)
}

/// Update a session's status.
pub async fn set_session_status(
    pool: &SqlitePool,
    id: Uuid,
    status: WorkstreamStatus,
) -> Result<()> {
    sqlx::query("UPDATE parallel_sessions SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set session status")?;

    Ok(())
}

/// Insert a workstream row for a session. `sections` lists the section
/// ids scheduled on it, in topological order.
pub async fn insert_workstream(
    pool: &SqlitePool,
    session_id: Uuid,
    clone_path: &str,
    min_position: i64,
    sections: &[String],
) -> Result<Workstream> {
    let sections_json =
        serde_json::to_string(sections).context("failed to serialize workstream sections")?;
    let workstream = sqlx::query_as::<_, Workstream>(
        "INSERT INTO workstreams (id, session_id, clone_path, status, min_position, sections) \
         VALUES ($1, $2, $3, 'pending', $4, $5) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(session_id)
    .bind(clone_path)
    .bind(min_position)
    .bind(sections_json)
    .fetch_one(pool)
    .await
    .context("failed to insert workstream")?;

    Ok(workstream)
}

/// Fetch a workstream by id.
pub async fn get_workstream(pool: &SqlitePool, id: Uuid) -> Result<Option<Workstream>> {
    let workstream = sqlx::query_as::<_, Workstream>("SELECT * FROM workstreams WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workstream")?;

    Ok(workstream)
}

/// List a session's workstreams in partition order (minimum internal
/// section position).
pub async fn list_for_session(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Workstream>> {
    let workstreams = sqlx::query_as::<_, Workstream>(
        "SELECT * FROM workstreams WHERE session_id = $1 ORDER BY min_position ASC, id ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .context("failed to list workstreams")?;

    Ok(workstreams)
}

/// Refresh a lease under the fence condition.
///
/// Succeeds (1 row) only while the row's `claim_generation` matches and
/// the owner is this runner (or unset) and the status is claimable.
/// A zero-row result means the caller has been fenced out and must
/// abort.
pub async fn refresh_lease(
    pool: &SqlitePool,
    workstream_id: Uuid,
    expected_generation: i64,
    runner_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workstreams SET \
             runner_id = $1, \
             lease_expires_at = $2, \
             status = CASE WHEN status = 'pending' THEN 'running' ELSE status END \
         WHERE id = $3 \
           AND claim_generation = $4 \
           AND (runner_id IS NULL OR runner_id = $1) \
           AND status IN ('pending', 'running')",
    )
    .bind(runner_id)
    .bind(now + LEASE_DURATION)
    .bind(workstream_id)
    .bind(expected_generation)
    .execute(pool)
    .await
    .context("failed to refresh workstream lease")?;

    Ok(result.rows_affected())
}

/// Reclaim a workstream whose lease has expired (or was never taken).
///
/// Bumps `claim_generation`, fencing out the previous owner forever.
/// Returns the updated row on success, `None` if the lease is still
/// live or the generation moved underneath us.
pub async fn reclaim_lease(
    pool: &SqlitePool,
    workstream_id: Uuid,
    expected_generation: i64,
    new_runner_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Workstream>> {
    let workstream = sqlx::query_as::<_, Workstream>(
        "UPDATE workstreams SET \
             claim_generation = claim_generation + 1, \
             runner_id = $1, \
             lease_expires_at = $2, \
             status = CASE WHEN status = 'pending' THEN 'running' ELSE status END \
         WHERE id = $3 \
           AND claim_generation = $4 \
           AND (lease_expires_at IS NULL OR lease_expires_at <= $5) \
           AND status IN ('pending', 'running') \
         RETURNING *",
    )
    .bind(new_runner_id)
    .bind(now + LEASE_DURATION)
    .bind(workstream_id)
    .bind(expected_generation)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to reclaim workstream lease")?;

    Ok(workstream)
}

/// Update a workstream's status under the fence condition.
pub async fn set_workstream_status(
    pool: &SqlitePool,
    workstream_id: Uuid,
    expected_generation: i64,
    status: WorkstreamStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workstreams SET status = $1 \
         WHERE id = $2 AND claim_generation = $3",
    )
    .bind(status)
    .bind(workstream_id)
    .bind(expected_generation)
    .execute(pool)
    .await
    .context("failed to set workstream status")?;

    Ok(result.rows_affected())
}

/// Record one conflict attempt, returning the new attempt count.
pub async fn record_conflict_attempt(
    pool: &SqlitePool,
    workstream_id: Uuid,
    next_retry_at: DateTime<Utc>,
) -> Result<i64> {
    let (attempts,): (i64,) = sqlx::query_as(
        "UPDATE workstreams SET \
             conflict_attempts = conflict_attempts + 1, \
             next_retry_at = $1 \
         WHERE id = $2 \
         RETURNING conflict_attempts",
    )
    .bind(next_retry_at)
    .bind(workstream_id)
    .fetch_one(pool)
    .await
    .context("failed to record conflict attempt")?;

    Ok(attempts)
}

/// Clear conflict bookkeeping after a successful resolution.
pub async fn clear_conflict_state(pool: &SqlitePool, workstream_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE workstreams SET conflict_attempts = 0, next_retry_at = NULL WHERE id = $1",
    )
    .bind(workstream_id)
    .execute(pool)
    .await
    .context("failed to clear conflict state")?;

    Ok(())
}

// -----------------------------------------------------------------------
// Merge locks
// -----------------------------------------------------------------------

/// Duration of one merge-lock grant.
pub const MERGE_LOCK_DURATION: Duration = Duration::seconds(120);

/// Acquire the merge lock for a session, or steal it if expired.
///
/// Stealing bumps `generation`, fencing out the prior holder. Returns
/// the generation now held, or `None` if another holder's lock is live.
pub async fn acquire_merge_lock(
    pool: &SqlitePool,
    session_id: Uuid,
    holder_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO merge_locks (session_id, holder_id, generation, expires_at) \
         VALUES ($1, $2, 0, $3) \
         ON CONFLICT (session_id) DO UPDATE SET \
             holder_id = excluded.holder_id, \
             generation = merge_locks.generation + 1, \
             expires_at = excluded.expires_at \
         WHERE merge_locks.expires_at <= $4 OR merge_locks.holder_id = excluded.holder_id \
         RETURNING generation",
    )
    .bind(session_id)
    .bind(holder_id)
    .bind(now + MERGE_LOCK_DURATION)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to acquire merge lock")?;

    Ok(row.map(|(generation,)| generation))
}

/// Refresh the merge lock under the fence condition. Zero rows means
/// the holder has been fenced out.
pub async fn refresh_merge_lock(
    pool: &SqlitePool,
    session_id: Uuid,
    holder_id: Uuid,
    expected_generation: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE merge_locks SET expires_at = $1 \
         WHERE session_id = $2 AND holder_id = $3 AND generation = $4",
    )
    .bind(now + MERGE_LOCK_DURATION)
    .bind(session_id)
    .bind(holder_id)
    .bind(expected_generation)
    .execute(pool)
    .await
    .context("failed to refresh merge lock")?;

    Ok(result.rows_affected())
}

/// Release the merge lock if still held.
pub async fn release_merge_lock(
    pool: &SqlitePool,
    session_id: Uuid,
    holder_id: Uuid,
) -> Result<()> {
    sqlx::query("DELETE FROM merge_locks WHERE session_id = $1 AND holder_id = $2")
        .bind(session_id)
        .bind(holder_id)
        .execute(pool)
        .await
        .context("failed to release merge lock")?;

    Ok(())
}

/// Record the most recent reconcile decision for observability.
pub async fn record_reconcile_action(
    pool: &SqlitePool,
    workstream_id: Uuid,
    action: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE workstreams SET last_reconcile_action = $1, last_reconciled_at = $2 \
         WHERE id = $3",
    )
    .bind(action)
    .bind(Utc::now())
    .bind(workstream_id)
    .execute(pool)
    .await
    .context("failed to record reconcile action")?;

    Ok(())
}
