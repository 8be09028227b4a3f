//! `steroids init`: register a project and create its store.

use std::path::Path;

use anyhow::{Context, Result};

use steroids_db::config::{GlobalPaths, ProjectPaths};
use steroids_db::pool;
use steroids_db::queries::projects;

pub async fn run(globals: &GlobalPaths, path: &Path, name: Option<&str>) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;

    let name = match name {
        Some(name) => name.to_string(),
        None => root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string()),
    };

    // Create and migrate the project store.
    let project_paths = ProjectPaths::new(&root);
    let project_pool = pool::open_project(&project_paths).await?;
    project_pool.close().await;

    // Register in the global store.
    let global_pool = pool::open_global(globals).await?;
    let project =
        projects::register_project(&global_pool, &root.to_string_lossy(), &name).await?;
    global_pool.close().await;

    println!(
        "initialized {} ({}) -- store at {}",
        project.name,
        project.path,
        project_paths.db_path().display()
    );
    Ok(crate::exit::SUCCESS)
}
