//! `steroids recover`: one stuck-task detection and recovery pass.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use steroids_core::config::Config;
use steroids_core::health::run_health_pass;
use steroids_core::hooks::TracingSink;
use steroids_db::config::{GlobalPaths, ProjectPaths};
use steroids_db::pool;

pub async fn run(globals: &GlobalPaths, path: &Path) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);

    let auto_migrate = std::env::var_os("STEROIDS_AUTO_MIGRATE").is_some();
    let project_pool = pool::open_project_existing(&paths, auto_migrate).await?;
    let global_pool = pool::open_global(globals).await?;

    let config = Config::load_for_project(
        &globals.root().join("config.toml"),
        &paths.state_dir().join("config.toml"),
    )?;

    let outcome = run_health_pass(
        &project_pool,
        &global_pool,
        &root.to_string_lossy(),
        &config.health,
        &TracingSink,
        Utc::now(),
    )
    .await?;

    println!("findings: {}", outcome.findings.len());
    for finding in &outcome.findings {
        println!(
            "  {} task={:?} runner={:?}",
            finding.mode, finding.task_id, finding.runner_id
        );
    }
    for action in &outcome.recovered_actions {
        println!("recovered: {action}");
    }
    if outcome.skipped_due_to_safety_limit > 0 {
        println!(
            "skipped {} recoveries (hourly incident cap)",
            outcome.skipped_due_to_safety_limit
        );
    }

    project_pool.close().await;
    global_pool.close().await;
    Ok(crate::exit::SUCCESS)
}
