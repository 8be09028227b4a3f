//! `steroids log`: audit trail, rejections, and invocation history for
//! one task.

use std::path::Path;

use anyhow::{Context, Result};
use uuid::Uuid;

use steroids_db::config::ProjectPaths;
use steroids_db::pool;
use steroids_db::queries::{audit, invocations, tasks};

pub async fn run(path: &Path, task_id: &str) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);
    let pool = pool::open_read_only(&paths.db_path())
        .await
        .context("project not initialized")?;

    let task_id = Uuid::parse_str(task_id).context("invalid task id")?;
    let task = tasks::get_task(&pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("{} -- {} ({})", task.id, task.title, task.status);
    println!(
        "rejections: {}  failures: {}",
        task.rejection_count, task.failure_count
    );

    let trail = audit::list_audit_for_task(&pool, task_id).await?;
    if !trail.is_empty() {
        println!("\naudit trail:");
        for entry in &trail {
            let notes = entry.notes.as_deref().unwrap_or("");
            println!(
                "  {}  {} -> {}  [{}]  {notes}",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.from_status,
                entry.to_status,
                entry.actor
            );
        }
    }

    let rejections = audit::list_rejections_for_task(&pool, task_id).await?;
    if !rejections.is_empty() {
        println!("\nrejections:");
        for rejection in &rejections {
            println!(
                "  #{} ({}/{}): {}",
                rejection.rejection_number,
                rejection.reviewer_provider,
                rejection.reviewer_model,
                rejection.notes
            );
        }
    }

    if let Some(note) = audit::latest_submission_note(&pool, task_id).await? {
        println!("\nlatest submission note:\n  {}", note.notes);
    }

    let history = invocations::list_for_task(&pool, task_id).await?;
    if !history.is_empty() {
        println!("\ninvocations (newest first):");
        for invocation in &history {
            let usage = invocation
                .parsed_token_usage()
                .map(|u| format!(" in={} out={}", u.input_tokens, u.output_tokens))
                .unwrap_or_default();
            println!(
                "  {}  {}  {}/{}  {}  {}ms{usage}",
                invocation.id,
                invocation.role,
                invocation.provider,
                invocation.model,
                invocation.status,
                invocation.duration_ms.unwrap_or(0)
            );
        }
    }

    pool.close().await;
    Ok(crate::exit::SUCCESS)
}
