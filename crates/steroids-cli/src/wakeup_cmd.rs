//! `steroids wakeup`: one sweep over all registered projects.

use anyhow::{Context, Result};

use steroids_core::config::Config;
use steroids_core::hooks::TracingSink;
use steroids_core::wakeup::{DetachedRunnerSpawner, WakeupParams, run_wakeup};
use steroids_db::config::GlobalPaths;
use steroids_db::pool;

pub async fn run(globals: &GlobalPaths, dry_run: bool) -> Result<i32> {
    let global_pool = pool::open_global(globals).await?;
    let sink = TracingSink;
    let spawner = DetachedRunnerSpawner {
        program: std::env::current_exe().context("cannot locate the steroids binary")?,
    };

    let mut config = Config::load_file(&globals.root().join("config.toml"))?;
    config.apply_env_overrides()?;
    let stale_timeout = chrono::Duration::from_std(config.runners.stale_timeout.get())
        .unwrap_or_else(|_| chrono::Duration::minutes(5));

    let auto_migrate = std::env::var_os("STEROIDS_AUTO_MIGRATE").is_some();
    let results = run_wakeup(&WakeupParams {
        global_paths: globals,
        global_pool: &global_pool,
        sink: &sink,
        spawner: &spawner,
        dry_run,
        auto_migrate,
        stale_timeout,
        max_concurrent: config.runners.max_concurrent,
    })
    .await?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    global_pool.close().await;
    Ok(crate::exit::SUCCESS)
}
