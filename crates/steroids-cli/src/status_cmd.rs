//! `steroids status`: read-only project summary.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use steroids_db::config::ProjectPaths;
use steroids_db::pool;
use steroids_db::queries::{incidents, sections, tasks};

pub async fn run(path: &Path) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);

    // Reporting opens read-only; the owning runner keeps the writer.
    let pool = pool::open_read_only(&paths.db_path())
        .await
        .context("project not initialized")?;

    let sections = sections::list_sections(&pool).await?;
    let all_tasks = tasks::list_all_tasks(&pool).await?;
    let open_incidents = incidents::list_open(&pool).await?;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for task in &all_tasks {
        *by_status.entry(task.status.to_string()).or_default() += 1;
    }

    println!("project: {}", root.display());
    println!("sections: {}", sections.len());
    for section in &sections {
        let count = all_tasks
            .iter()
            .filter(|t| t.section_id.as_deref() == Some(section.id.as_str()))
            .count();
        let marker = if section.skipped {
            " (skipped)"
        } else if !steroids_db::queries::sections::dependencies_satisfied(&pool, &section.id)
            .await?
        {
            " (blocked)"
        } else {
            ""
        };
        println!(
            "  [{:>3}] {} -- {count} tasks{marker}",
            section.priority, section.name
        );
    }
    println!("tasks: {}", all_tasks.len());
    for (status, count) in &by_status {
        println!("  {status}: {count}");
    }
    if !open_incidents.is_empty() {
        println!("open incidents: {}", open_incidents.len());
        for incident in &open_incidents {
            println!(
                "  {} {} (detected {})",
                incident.failure_mode, incident.id, incident.detected_at
            );
        }
    }

    pool.close().await;
    Ok(crate::exit::SUCCESS)
}
