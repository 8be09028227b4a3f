//! `steroids batch`: one coder and one reviewer invocation for a whole
//! section.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use steroids_core::config::Config;
use steroids_core::gitops::CommandGit;
use steroids_core::hooks::TracingSink;
use steroids_core::lock::ProjectLock;
use steroids_core::orchestration::{OrchestrationContext, run_section_batch};
use steroids_core::provider::ProviderRegistry;
use steroids_core::provider::claude::ClaudeCliInvoker;
use steroids_db::config::{GlobalPaths, ProjectPaths};
use steroids_db::pool;
use steroids_db::queries::sections;

pub async fn run(globals: &GlobalPaths, path: &Path, section_name: &str) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);

    let auto_migrate = std::env::var_os("STEROIDS_AUTO_MIGRATE").is_some();
    let project_pool = pool::open_project_existing(&paths, auto_migrate).await?;

    let config = Config::load_for_project(
        &globals.root().join("config.toml"),
        &paths.state_dir().join("config.toml"),
    )?;

    let section = sections::list_sections(&project_pool)
        .await?
        .into_iter()
        .find(|s| s.name == section_name);
    let Some(section) = section else {
        bail!("section {section_name:?} not found");
    };

    let lock = ProjectLock::acquire(&paths.lock_path())
        .map_err(|e| anyhow::anyhow!(e))
        .context("another runner holds this project")?;

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(ClaudeCliInvoker::new(
        config.ai.coder.model.clone(),
    )));

    let ctx = OrchestrationContext {
        pool: project_pool.clone(),
        paths: paths.clone(),
        config,
        registry: Arc::new(registry),
        git: Arc::new(CommandGit::new()),
        sink: Arc::new(TracingSink),
        cancel: CancellationToken::new(),
        lease: None,
        workdir: root,
    };

    let results = run_section_batch(&ctx, &section.id)
        .await
        .map_err(anyhow::Error::from)?;

    for (task_id, outcome) in &results {
        println!("{task_id}  {outcome:?}");
    }

    lock.release().map_err(|e| anyhow::anyhow!(e))?;
    Ok(crate::exit::SUCCESS)
}
