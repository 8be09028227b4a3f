//! `steroids tasks` / `steroids force`: task listing and operator
//! overrides.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use steroids_core::hooks::{HookEvent, HookKind, TracingSink, emit_best_effort};
use steroids_core::state::dispatch;
use steroids_db::config::ProjectPaths;
use steroids_db::models::TaskStatus;
use steroids_db::pool;
use steroids_db::queries::tasks;

pub async fn list(path: &Path) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);
    let pool = pool::open_read_only(&paths.db_path())
        .await
        .context("project not initialized")?;

    for task in tasks::list_all_tasks(&pool).await? {
        let section = task.section_id.as_deref().unwrap_or("-");
        println!(
            "{}  {:<12} rej={:<2} {}  [{}]",
            task.id, task.status, task.rejection_count, task.title, section
        );
    }

    pool.close().await;
    Ok(crate::exit::SUCCESS)
}

pub async fn add(
    path: &Path,
    title: &str,
    section_name: &str,
    priority: i64,
    depends_on: &[String],
) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);

    let auto_migrate = std::env::var_os("STEROIDS_AUTO_MIGRATE").is_some();
    let pool = pool::open_project_existing(&paths, auto_migrate).await?;

    // The "cli" source tag keeps operator-created sections distinct
    // from plan-imported ones: a later import of a same-named section
    // from a plan file hashes under its own source and must not alias
    // this one. Do not change this to a plan filename.
    let section_id = steroids_db::models::section_id("cli", section_name);
    // Position the section after whatever already exists.
    let existing = steroids_db::queries::sections::list_sections(&pool).await?;
    let position = existing
        .iter()
        .find(|s| s.id == section_id)
        .map(|s| s.position)
        .unwrap_or(existing.len() as i64);
    steroids_db::queries::sections::upsert_section(
        &pool,
        &section_id,
        section_name,
        position,
        priority,
        None,
    )
    .await?;

    for dependency_name in depends_on {
        let dependency = existing
            .iter()
            .find(|s| &s.name == dependency_name)
            .with_context(|| format!("dependency section {dependency_name:?} not found"))?;
        steroids_db::queries::sections::insert_dependency(&pool, &section_id, &dependency.id)
            .await?;
    }

    let siblings = tasks::list_tasks_for_section(&pool, &section_id).await?;
    let task = tasks::insert_task(
        &pool,
        title,
        Some(&section_id),
        siblings.len() as i64,
        priority,
        None,
        None,
    )
    .await?;
    println!("added task {} -- {}", task.id, task.title);

    emit_best_effort(
        &TracingSink,
        HookEvent::new(
            root.to_string_lossy(),
            HookKind::TaskCreated {
                task_id: task.id,
                title: task.title.clone(),
            },
        ),
    )
    .await;

    pool.close().await;
    Ok(crate::exit::SUCCESS)
}

pub async fn skip_section(path: &Path, section_name: &str, skipped: bool) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);

    let auto_migrate = std::env::var_os("STEROIDS_AUTO_MIGRATE").is_some();
    let pool = pool::open_project_existing(&paths, auto_migrate).await?;

    let section = steroids_db::queries::sections::list_sections(&pool)
        .await?
        .into_iter()
        .find(|s| s.name == section_name);
    let Some(section) = section else {
        bail!("section {section_name:?} not found");
    };

    steroids_db::queries::sections::set_section_skipped(&pool, &section.id, skipped).await?;
    println!(
        "section {} is now {}",
        section.name,
        if skipped { "skipped" } else { "active" }
    );

    pool.close().await;
    Ok(crate::exit::SUCCESS)
}

pub async fn force(path: &Path, task_id: &str, status: &str, note: Option<&str>) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);

    let task_id = Uuid::parse_str(task_id).context("invalid task id")?;
    let status = TaskStatus::from_str(status)?;
    if !matches!(
        status,
        TaskStatus::Pending | TaskStatus::Failed | TaskStatus::Skipped
    ) {
        bail!("force may only target pending, failed, or skipped");
    }

    let auto_migrate = std::env::var_os("STEROIDS_AUTO_MIGRATE").is_some();
    let pool = pool::open_project_existing(&paths, auto_migrate).await?;

    dispatch::force(&pool, task_id, status, note).await?;
    println!("task {task_id} forced to {status}");

    pool.close().await;
    Ok(crate::exit::SUCCESS)
}
