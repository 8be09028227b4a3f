//! `steroids parallel`: fan a project out over workstream clones,
//! execute them concurrently, and merge the results.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use steroids_core::config::Config;
use steroids_core::gitops::{CommandGit, GitOps};
use steroids_core::hooks::TracingSink;
use steroids_core::lock::ProjectLock;
use steroids_core::merge::session::{prepare_session, run_parallel};
use steroids_core::orchestration::OrchestrationContext;
use steroids_core::provider::ProviderRegistry;
use steroids_core::provider::claude::ClaudeCliInvoker;
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
    if !config.runners.parallel.enabled {
        anyhow::bail!("parallel mode is disabled; set [runners.parallel] enabled = true");
    }

    // One parallel driver per project: the project lock covers the
    // whole fan-out.
    let lock = ProjectLock::acquire(&paths.lock_path())
        .map_err(|e| anyhow::anyhow!(e))
        .context("another runner holds this project")?;

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(ClaudeCliInvoker::new(
        config.ai.coder.model.clone(),
    )));

    let git = Arc::new(CommandGit::new());
    let integration_branch = match &config.git.branch {
        Some(branch) => branch.clone(),
        None => git
            .as_ref()
            .current_branch(&root)
            .await?
            .context("integration branch not resolvable; set [git] branch")?,
    };

    let workspace_root = config
        .runners
        .parallel
        .workspace_root
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| paths.state_dir().join("workspaces"));
    std::fs::create_dir_all(&workspace_root)
        .with_context(|| format!("failed to create {}", workspace_root.display()))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let ctx = OrchestrationContext {
        pool: project_pool.clone(),
        paths: paths.clone(),
        config: config.clone(),
        registry: Arc::new(registry),
        git,
        sink: Arc::new(TracingSink),
        cancel,
        lease: None,
        workdir: root.clone(),
    };

    let prepared = prepare_session(
        &ctx,
        &global_pool,
        &integration_branch,
        &workspace_root,
        config.runners.parallel.max_clones,
    )
    .await?;

    let outcome = run_parallel(
        &ctx,
        &global_pool,
        &prepared,
        &integration_branch,
        Some(workspace_root),
        config.runners.parallel.validation_command.clone(),
        config.runners.parallel.cleanup_on_success,
        config.runners.parallel.cleanup_on_failure,
    )
    .await
    .map_err(anyhow::Error::from)?;

    println!(
        "merge complete: {} applied, {} skipped, {} conflicts resolved",
        outcome.applied, outcome.skipped, outcome.conflicts_resolved
    );

    lock.release().map_err(|e| anyhow::anyhow!(e))?;
    Ok(crate::exit::SUCCESS)
}
