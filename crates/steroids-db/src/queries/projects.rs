//! Queries for the global `projects` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::Project;

/// Register a project, or re-enable and rename it if already present.
pub async fn register_project(pool: &SqlitePool, path: &str, name: &str) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (path, name, enabled, created_at) \
         VALUES ($1, $2, 1, $3) \
         ON CONFLICT (path) DO UPDATE SET name = excluded.name, enabled = 1 \
         RETURNING *",
    )
    .bind(path)
    .bind(name)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to register project")?;

    Ok(project)
}

/// Fetch a project by its absolute path.
pub async fn get_project(pool: &SqlitePool, path: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE path = $1")
        .bind(path)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all enabled projects, ordered by path for deterministic sweeps.
pub async fn list_enabled_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let projects =
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE enabled = 1 ORDER BY path")
            .fetch_all(pool)
            .await
            .context("failed to list enabled projects")?;

    Ok(projects)
}

/// Enable or disable a project.
pub async fn set_project_enabled(pool: &SqlitePool, path: &str, enabled: bool) -> Result<()> {
    let result = sqlx::query("UPDATE projects SET enabled = $1 WHERE path = $2")
        .bind(enabled)
        .bind(path)
        .execute(pool)
        .await
        .context("failed to update project enabled flag")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("project {path} not registered");
    }

    Ok(())
}

/// Remove a project registration.
pub async fn remove_project(pool: &SqlitePool, path: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM projects WHERE path = $1")
        .bind(path)
        .execute(pool)
        .await
        .context("failed to remove project")?;

    Ok(result.rows_affected() > 0)
}
