//! Queries for `tasks` and `task_locks`.
//!
//! Status mutations go through [`transition_task`], which writes the
//! status change and its audit entry (and, for rejections, the
//! rejection row and counter bump) in a single transaction. The WHERE
//! clause carries the expected current status, so a lost race shows up
//! as zero rows affected rather than a silent overwrite.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::models::{Actor, Task, TaskLock, TaskStatus};

/// Insert a new task row.
pub async fn insert_task(
    pool: &SqlitePool,
    title: &str,
    section_id: Option<&str>,
    position: i64,
    priority: i64,
    source_file: Option<&str>,
    file_path: Option<&str>,
) -> Result<Task> {
    let now = Utc::now();
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
             (id, title, section_id, position, priority, source_file, file_path, \
              created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(title)
    .bind(section_id)
    .bind(position)
    .bind(priority)
    .bind(source_file)
    .bind(file_path)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks for a section in `(priority, position, id)` order.
pub async fn list_tasks_for_section(pool: &SqlitePool, section_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE section_id = $1 \
         ORDER BY priority ASC, position ASC, id ASC",
    )
    .bind(section_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for section")?;

    Ok(tasks)
}

/// List every task in the project store.
pub async fn list_all_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks ORDER BY priority ASC, position ASC, id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Effect of a transition beyond the status change itself.
#[derive(Debug, Clone, Default)]
pub struct TransitionExtras<'a> {
    /// Audit notes.
    pub notes: Option<&'a str>,
    /// When set, a rejection row is inserted and `rejection_count` is
    /// incremented atomically with the transition.
    pub rejection: Option<RejectionDetails<'a>>,
    /// When set, `failure_count` is incremented.
    pub bump_failure_count: bool,
}

/// Reviewer identity recorded with a rejection.
#[derive(Debug, Clone, Copy)]
pub struct RejectionDetails<'a> {
    pub notes: &'a str,
    pub reviewer_provider: &'a str,
    pub reviewer_model: &'a str,
}

/// Atomically transition a task and append the audit entry.
///
/// Returns the number of task rows affected: 0 means the task was not
/// in `from` (lost race or missing task) and nothing was written.
pub async fn transition_task(
    pool: &SqlitePool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    actor: Actor,
    extras: TransitionExtras<'_>,
) -> Result<u64> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transition")?;

    let failure_bump = if extras.bump_failure_count { 1 } else { 0 };
    let rejection_bump = if extras.rejection.is_some() { 1 } else { 0 };

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             updated_at = $2, \
             rejection_count = rejection_count + $3, \
             failure_count = failure_count + $4 \
         WHERE id = $5 AND status = $6",
    )
    .bind(to)
    .bind(now)
    .bind(rejection_bump)
    .bind(failure_bump)
    .bind(task_id)
    .bind(from)
    .execute(&mut *tx)
    .await
    .context("failed to update task status")?;

    if result.rows_affected() == 0 {
        tx.rollback().await.ok();
        return Ok(0);
    }

    sqlx::query(
        "INSERT INTO audit_log (task_id, from_status, to_status, actor, notes, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(task_id)
    .bind(from)
    .bind(to)
    .bind(actor)
    .bind(extras.notes)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to append audit entry")?;

    if let Some(rejection) = extras.rejection {
        // rejection_count was already bumped above; the row number is the
        // new value.
        let (number,): (i64,) =
            sqlx::query_as("SELECT rejection_count FROM tasks WHERE id = $1")
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await
                .context("failed to read rejection count")?;

        sqlx::query(
            "INSERT INTO rejections \
                 (task_id, rejection_number, notes, reviewer_provider, reviewer_model, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(task_id)
        .bind(number)
        .bind(rejection.notes)
        .bind(rejection.reviewer_provider)
        .bind(rejection.reviewer_model)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to insert rejection entry")?;
    }

    tx.commit().await.context("failed to commit transition")?;
    Ok(result.rows_affected())
}

/// Bump `failure_count` without a status change (non-submitting coder
/// cycles).
pub async fn bump_failure_count(pool: &SqlitePool, task_id: Uuid) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "UPDATE tasks SET failure_count = failure_count + 1, updated_at = $1 \
         WHERE id = $2 \
         RETURNING failure_count",
    )
    .bind(Utc::now())
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to bump failure count")?;

    Ok(count)
}

/// Count of tasks that still represent pending work: `pending` or
/// `in_progress`.
pub async fn count_pending_work(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE status IN ('pending', 'in_progress')",
    )
    .fetch_one(pool)
    .await
    .context("failed to count pending work")?;

    Ok(count)
}

/// Tasks updated before `cutoff` that sit in `in_progress` or `review`
/// (stuck-detection candidates).
pub async fn list_stale_active_tasks(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('in_progress', 'review') AND updated_at < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stale active tasks")?;

    Ok(tasks)
}

/// Pick the next eligible task, optionally restricted to a set of
/// sections (one workstream).
///
/// A task is pickable when:
/// - its status is `pending` or `in_progress`;
/// - its section is not skipped and all dependency sections have every
///   task in `completed` or `skipped`;
/// - no unexpired task lock covers it.
///
/// Ties break on
/// `(section priority, section position, task priority, task position, task id)`.
pub async fn next_eligible_task(
    pool: &SqlitePool,
    section_filter: Option<&[String]>,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT t.* FROM tasks t \
         JOIN sections s ON s.id = t.section_id \
         WHERE t.status IN ('pending', 'in_progress') \
           AND s.skipped = 0 \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_locks tl \
               WHERE tl.task_id = t.id AND tl.expires_at > ",
    );
    qb.push_bind(now);
    qb.push(
        ") \
           AND NOT EXISTS ( \
               SELECT 1 FROM section_dependencies sd \
               JOIN sections dep ON dep.id = sd.depends_on_section_id \
               WHERE sd.section_id = s.id \
                 AND dep.skipped = 0 \
                 AND EXISTS ( \
                     SELECT 1 FROM tasks dt \
                     WHERE dt.section_id = dep.id \
                       AND dt.status NOT IN ('completed', 'skipped') \
                 ) \
           )",
    );

    if let Some(sections) = section_filter {
        if sections.is_empty() {
            return Ok(None);
        }
        qb.push(" AND t.section_id IN (");
        let mut separated = qb.separated(", ");
        for section in sections {
            separated.push_bind(section);
        }
        qb.push(")");
    }

    qb.push(
        " ORDER BY s.priority ASC, s.position ASC, \
                   t.priority ASC, t.position ASC, t.id ASC \
          LIMIT 1",
    );

    let task = qb
        .build_query_as::<Task>()
        .fetch_optional(pool)
        .await
        .context("failed to pick next eligible task")?;

    Ok(task)
}

/// Pick a task parked in `review` (an unclear reviewer decision leaves
/// it there for the next cycle), optionally restricted to sections.
pub async fn next_review_task(
    pool: &SqlitePool,
    section_filter: Option<&[String]>,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT t.* FROM tasks t \
         JOIN sections s ON s.id = t.section_id \
         WHERE t.status = 'review' \
           AND s.skipped = 0 \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_locks tl \
               WHERE tl.task_id = t.id AND tl.expires_at > ",
    );
    qb.push_bind(now);
    qb.push(")");

    if let Some(sections) = section_filter {
        if sections.is_empty() {
            return Ok(None);
        }
        qb.push(" AND t.section_id IN (");
        let mut separated = qb.separated(", ");
        for section in sections {
            separated.push_bind(section);
        }
        qb.push(")");
    }

    qb.push(
        " ORDER BY s.priority ASC, s.position ASC, \
                   t.priority ASC, t.position ASC, t.id ASC \
          LIMIT 1",
    );

    let task = qb
        .build_query_as::<Task>()
        .fetch_optional(pool)
        .await
        .context("failed to pick parked review task")?;

    Ok(task)
}

// -----------------------------------------------------------------------
// Task locks
// -----------------------------------------------------------------------

/// Acquire (or steal an expired) task lock. Returns `true` when this
/// runner now holds the lock.
pub async fn acquire_task_lock(
    pool: &SqlitePool,
    task_id: Uuid,
    runner_id: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO task_locks (task_id, runner_id, expires_at) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (task_id) DO UPDATE SET \
             runner_id = excluded.runner_id, \
             expires_at = excluded.expires_at \
         WHERE task_locks.expires_at <= $4 OR task_locks.runner_id = excluded.runner_id",
    )
    .bind(task_id)
    .bind(runner_id)
    .bind(expires_at)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to acquire task lock")?;

    Ok(result.rows_affected() > 0)
}

/// Extend every lock held by a runner (heartbeat path).
pub async fn refresh_task_locks(
    pool: &SqlitePool,
    runner_id: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE task_locks SET expires_at = $1 WHERE runner_id = $2")
        .bind(expires_at)
        .bind(runner_id)
        .execute(pool)
        .await
        .context("failed to refresh task locks")?;

    Ok(result.rows_affected())
}

/// Release one task lock if held by this runner.
pub async fn release_task_lock(pool: &SqlitePool, task_id: Uuid, runner_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM task_locks WHERE task_id = $1 AND runner_id = $2")
        .bind(task_id)
        .bind(runner_id)
        .execute(pool)
        .await
        .context("failed to release task lock")?;

    Ok(())
}

/// Remove a task lock regardless of owner (recovery path).
pub async fn clear_task_lock(pool: &SqlitePool, task_id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM task_locks WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to clear task lock")?;

    Ok(result.rows_affected() > 0)
}

/// Fetch the lock row for a task, if any.
pub async fn get_task_lock(pool: &SqlitePool, task_id: Uuid) -> Result<Option<TaskLock>> {
    let lock = sqlx::query_as::<_, TaskLock>("SELECT * FROM task_locks WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task lock")?;

    Ok(lock)
}
