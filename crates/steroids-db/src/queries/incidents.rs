//! Queries for the `incidents` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{FailureMode, Incident};

/// Record a new incident. `details` is serialized JSON.
pub async fn insert_incident(
    pool: &SqlitePool,
    task_id: Option<Uuid>,
    runner_id: Option<Uuid>,
    failure_mode: FailureMode,
    details: &serde_json::Value,
) -> Result<Incident> {
    let now = Utc::now();
    let incident = sqlx::query_as::<_, Incident>(
        "INSERT INTO incidents \
             (id, task_id, runner_id, failure_mode, detected_at, details, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $5) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(task_id)
    .bind(runner_id)
    .bind(failure_mode)
    .bind(now)
    .bind(details.to_string())
    .fetch_one(pool)
    .await
    .context("failed to insert incident")?;

    Ok(incident)
}

/// Mark an incident resolved with a resolution label.
pub async fn resolve_incident(pool: &SqlitePool, id: Uuid, resolution: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE incidents SET resolved_at = $1, resolution = $2 \
         WHERE id = $3 AND resolved_at IS NULL",
    )
    .bind(Utc::now())
    .bind(resolution)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resolve incident")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("incident {id} not found or already resolved");
    }

    Ok(())
}

/// Number of incidents detected in the trailing hour. The recovery
/// safety cap compares against this.
pub async fn count_recent(pool: &SqlitePool, now: DateTime<Utc>) -> Result<i64> {
    let cutoff = now - Duration::hours(1);
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM incidents WHERE detected_at > $1")
            .bind(cutoff)
            .fetch_one(pool)
            .await
            .context("failed to count recent incidents")?;

    Ok(count)
}

/// List unresolved incidents, oldest first.
pub async fn list_open(pool: &SqlitePool) -> Result<Vec<Incident>> {
    let incidents = sqlx::query_as::<_, Incident>(
        "SELECT * FROM incidents WHERE resolved_at IS NULL ORDER BY detected_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list open incidents")?;

    Ok(incidents)
}
