//! Queries for `sections` and `section_dependencies`.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Section, SectionDependency};

/// Insert or update a section. The id is the stable hash from
/// [`crate::models::section_id`], so re-importing the same plan file is
/// idempotent.
pub async fn upsert_section(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    position: i64,
    priority: i64,
    source_file: Option<&str>,
) -> Result<Section> {
    let section = sqlx::query_as::<_, Section>(
        "INSERT INTO sections (id, name, position, priority, source_file, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (id) DO UPDATE SET \
             name = excluded.name, \
             position = excluded.position, \
             priority = excluded.priority \
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(position)
    .bind(priority)
    .bind(source_file)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to upsert section")?;

    Ok(section)
}

/// Fetch a section by id.
pub async fn get_section(pool: &SqlitePool, id: &str) -> Result<Option<Section>> {
    let section = sqlx::query_as::<_, Section>("SELECT * FROM sections WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch section")?;

    Ok(section)
}

/// List all sections in canonical order: `(priority, position, id)`,
/// smaller priority number first.
pub async fn list_sections(pool: &SqlitePool) -> Result<Vec<Section>> {
    let sections = sqlx::query_as::<_, Section>(
        "SELECT * FROM sections ORDER BY priority ASC, position ASC, id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list sections")?;

    Ok(sections)
}

/// Mark a section skipped (or unskipped).
pub async fn set_section_skipped(pool: &SqlitePool, id: &str, skipped: bool) -> Result<()> {
    let result = sqlx::query("UPDATE sections SET skipped = $1 WHERE id = $2")
        .bind(skipped)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set section skipped")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("section {id} not found");
    }

    Ok(())
}

/// Insert a dependency edge: `section_id` depends on `depends_on`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_dependency(
    pool: &SqlitePool,
    section_id: &str,
    depends_on: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO section_dependencies (section_id, depends_on_section_id) \
         VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(section_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .context("failed to insert section dependency")?;

    Ok(())
}

/// List every dependency edge in the project.
pub async fn list_dependencies(pool: &SqlitePool) -> Result<Vec<SectionDependency>> {
    let deps = sqlx::query_as::<_, SectionDependency>(
        "SELECT section_id, depends_on_section_id FROM section_dependencies",
    )
    .fetch_all(pool)
    .await
    .context("failed to list section dependencies")?;

    Ok(deps)
}

/// True when every task of every (non-skipped) section that
/// `section_id` depends on has reached `completed` or `skipped`.
pub async fn dependencies_satisfied(pool: &SqlitePool, section_id: &str) -> Result<bool> {
    let (blocked,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM section_dependencies sd \
         JOIN sections dep ON dep.id = sd.depends_on_section_id \
         WHERE sd.section_id = $1 \
           AND dep.skipped = 0 \
           AND EXISTS ( \
               SELECT 1 FROM tasks dt \
               WHERE dt.section_id = dep.id \
                 AND dt.status NOT IN ('completed', 'skipped') \
           )",
    )
    .bind(section_id)
    .fetch_one(pool)
    .await
    .context("failed to check section dependencies")?;

    Ok(blocked == 0)
}

/// True when all tasks in the section are terminal, i.e. the section is
/// finished from the scheduler's point of view.
pub async fn section_is_complete(pool: &SqlitePool, section_id: &str) -> Result<bool> {
    let (open,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE section_id = $1 \
           AND status NOT IN ('completed', 'skipped', 'failed', 'disputed')",
    )
    .bind(section_id)
    .fetch_one(pool)
    .await
    .context("failed to check section completion")?;

    Ok(open == 0)
}
