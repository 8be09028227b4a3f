//! `steroids projects`: global registry administration.

use anyhow::Result;
use clap::Subcommand;

use steroids_db::config::GlobalPaths;
use steroids_db::pool;
use steroids_db::queries::projects;

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// List registered projects
    List,
    /// Disable a project (wakeup skips it)
    Disable { path: String },
    /// Re-enable a project
    Enable { path: String },
    /// Remove a project registration (its store stays on disk)
    Remove { path: String },
}

pub async fn run(globals: &GlobalPaths, command: ProjectCommands) -> Result<i32> {
    let pool = pool::open_global(globals).await?;

    match command {
        ProjectCommands::List => {
            for project in projects::list_enabled_projects(&pool).await? {
                println!("{}  {}", project.path, project.name);
            }
        }
        ProjectCommands::Disable { path } => {
            projects::set_project_enabled(&pool, &path, false).await?;
            println!("disabled {path}");
        }
        ProjectCommands::Enable { path } => {
            projects::set_project_enabled(&pool, &path, true).await?;
            println!("enabled {path}");
        }
        ProjectCommands::Remove { path } => {
            if projects::remove_project(&pool, &path).await? {
                println!("removed {path}");
            } else {
                println!("{path} was not registered");
            }
        }
    }

    pool.close().await;
    Ok(crate::exit::SUCCESS)
}
