//! `steroids run`: the runner supervisor for one project.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use steroids_core::config::Config;
use steroids_core::gitops::CommandGit;
use steroids_core::hooks::TracingSink;
use steroids_core::provider::claude::ClaudeCliInvoker;
use steroids_core::provider::ProviderRegistry;
use steroids_core::runner::{RunnerExit, RunnerParams, run_runner};
use steroids_db::config::{GlobalPaths, ProjectPaths};
use steroids_db::pool;

pub async fn run(globals: &GlobalPaths, path: &Path, once: bool) -> Result<i32> {
    let root = path
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path.display()))?;
    let paths = ProjectPaths::new(&root);

    let auto_migrate = std::env::var_os("STEROIDS_AUTO_MIGRATE").is_some();
    let project_pool = pool::open_project_existing(&paths, auto_migrate).await?;
    let global_pool = pool::open_global(globals).await?;

    let global_config_path = globals.root().join("config.toml");
    let project_config_path = paths.state_dir().join("config.toml");
    let config = Config::load_for_project(&global_config_path, &project_config_path)?;

    // The provider registry is process-wide: built once, installed as
    // the singleton, never mutated afterwards.
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(ClaudeCliInvoker::new(
        config.ai.coder.model.clone(),
    )));
    registry
        .clone()
        .install()
        .context("provider registry already installed")?;
    let registry = Arc::new(registry);

    // Ctrl-C is the stop signal; everything checks this token.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("stop signal received");
                cancel.cancel();
            }
        });
    }

    let reload_config = {
        let global_config_path = global_config_path.clone();
        let project_config_path = project_config_path.clone();
        Arc::new(move || Config::load_for_project(&global_config_path, &project_config_path))
    };

    let exit = run_runner(RunnerParams {
        global_pool,
        project_pool,
        paths,
        config,
        registry,
        git: Arc::new(CommandGit::new()),
        sink: Arc::new(TracingSink),
        cancel,
        once_mode: once,
        reload_config,
        section_filter: None,
        lease: None,
        workdir: root,
    })
    .await?;

    let code = match exit {
        RunnerExit::CreditFailedOnce => crate::exit::CREDIT_ONCE_FAIL,
        _ => crate::exit::SUCCESS,
    };
    Ok(code)
}
