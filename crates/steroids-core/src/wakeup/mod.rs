//! Wakeup controller: the periodic sweep reconciling registered
//! projects with running runners.
//!
//! Each pass recovers the global zombie lock, clears stale runner rows,
//! runs a stuck-task recovery pass per project, and spawns a detached
//! runner supervisor for any enabled project with pending work and no
//! active runner.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;

use steroids_db::config::{GlobalPaths, ProjectPaths};
use steroids_db::pool;
use steroids_db::queries::{projects as project_db, runners as runner_db, tasks as task_db};

use crate::config::Config;
use crate::hooks::EventSink;
use crate::lock::{pid_alive, recover_zombie};

/// What the sweep did for one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeupAction {
    Started,
    WouldStart,
    None,
    Cleaned,
}

/// Per-project result record.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectWakeupResult {
    pub project_path: String,
    pub action: WakeupAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub recovered_actions: Vec<String>,
    pub skipped_recovery_due_to_safety_limit: usize,
}

/// Launches a detached runner supervisor process for a project.
pub trait RunnerSpawner: Send + Sync {
    fn spawn(&self, project_path: &Path) -> Result<u32>;
}

/// Spawns `steroids run <project>` detached from the current process.
pub struct DetachedRunnerSpawner {
    /// Path to the steroids binary (usually `current_exe`).
    pub program: std::path::PathBuf,
}

impl RunnerSpawner for DetachedRunnerSpawner {
    fn spawn(&self, project_path: &Path) -> Result<u32> {
        let mut command = std::process::Command::new(&self.program);
        command
            .arg("run")
            .arg(project_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group: the runner outlives this sweep.
            command.process_group(0);
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn runner for {}", project_path.display()))?;
        Ok(child.id())
    }
}

/// Parameters for one wakeup sweep.
pub struct WakeupParams<'a> {
    pub global_paths: &'a GlobalPaths,
    pub global_pool: &'a SqlitePool,
    pub sink: &'a dyn EventSink,
    pub spawner: &'a dyn RunnerSpawner,
    /// Report `would_start` instead of spawning.
    pub dry_run: bool,
    /// Permit project schema migration on open.
    pub auto_migrate: bool,
    /// Heartbeat age past which a runner row is stale
    /// (`runners.stale_timeout`).
    pub stale_timeout: chrono::Duration,
    /// Global cap on live runners (`runners.max_concurrent`).
    pub max_concurrent: usize,
}

/// Run one sweep over all registered projects.
pub async fn run_wakeup(params: &WakeupParams<'_>) -> Result<Vec<ProjectWakeupResult>> {
    // 1. Global zombie-lock recovery.
    if let Err(e) = recover_zombie(&params.global_paths.lock_path()) {
        tracing::warn!(error = %e, "global zombie lock recovery failed");
    }

    // 2. Stale runner rows go away before we decide anything.
    let now = Utc::now();
    let cleaned =
        runner_db::delete_stale_runners(params.global_pool, now, params.stale_timeout).await?;
    let cleaned_paths: Vec<String> = cleaned.iter().map(|r| r.project_path.clone()).collect();
    if !cleaned.is_empty() {
        tracing::info!(count = cleaned.len(), "removed stale runner rows");
    }

    // 3. Per-project pass, bounded by the global runner cap.
    let mut live = runner_db::count_live_runners(params.global_pool, now, params.stale_timeout)
        .await? as usize;
    let projects = project_db::list_enabled_projects(params.global_pool).await?;
    let mut results = Vec::with_capacity(projects.len());

    for project in projects {
        let result = wakeup_project(params, &project.path, &cleaned_paths, &mut live).await;
        match result {
            Ok(record) => results.push(record),
            Err(e) => {
                tracing::error!(project = %project.path, error = %e, "wakeup failed for project");
                results.push(ProjectWakeupResult {
                    project_path: project.path.clone(),
                    action: WakeupAction::None,
                    reason: Some(format!("error: {e}")),
                    pid: None,
                    recovered_actions: Vec::new(),
                    skipped_recovery_due_to_safety_limit: 0,
                });
            }
        }
    }

    Ok(results)
}

async fn wakeup_project(
    params: &WakeupParams<'_>,
    project_path: &str,
    cleaned_paths: &[String],
    live: &mut usize,
) -> Result<ProjectWakeupResult> {
    let was_cleaned = cleaned_paths.iter().any(|p| p == project_path);
    let mut record = ProjectWakeupResult {
        project_path: project_path.to_string(),
        action: if was_cleaned {
            WakeupAction::Cleaned
        } else {
            WakeupAction::None
        },
        reason: None,
        pid: None,
        recovered_actions: Vec::new(),
        skipped_recovery_due_to_safety_limit: 0,
    };

    let root = Path::new(project_path);
    if !root.is_dir() {
        record.reason = Some("project directory missing".to_string());
        return Ok(record);
    }

    let paths = ProjectPaths::new(root);
    if !paths.is_initialized() {
        record.reason = Some("project not initialized".to_string());
        return Ok(record);
    }

    let project_pool = pool::open_project_existing(&paths, params.auto_migrate).await?;

    // 3a. Stuck-task recovery pass with the project's own config.
    let config = Config::load_for_project(
        &params.global_paths.root().join("config.toml"),
        &paths.state_dir().join("config.toml"),
    )?;
    let health = crate::health::run_health_pass(
        &project_pool,
        params.global_pool,
        project_path,
        &config.health,
        params.sink,
        Utc::now(),
    )
    .await?;
    record.recovered_actions = health.recovered_actions;
    record.skipped_recovery_due_to_safety_limit = health.skipped_due_to_safety_limit;

    // 3b. An active runner already covers this project.
    let project_runners = runner_db::list_live_runners_for_project(
        params.global_pool,
        project_path,
        Utc::now(),
        params.stale_timeout,
    )
    .await?;
    let active = project_runners
        .iter()
        .any(|r| r.pid.map(|pid| pid_alive(pid as u32)).unwrap_or(false));
    if active {
        record.reason = Some("active runner present".to_string());
        return Ok(record);
    }

    // 3c. Nothing to do without pending work.
    if task_db::count_pending_work(&project_pool).await? == 0 {
        record.reason = Some("no pending work".to_string());
        return Ok(record);
    }

    // 3d. Spawn (or report) a runner, within the global cap.
    if *live >= params.max_concurrent {
        record.reason = Some("global runner cap reached".to_string());
        return Ok(record);
    }
    if params.dry_run {
        record.action = WakeupAction::WouldStart;
    } else {
        let pid = params.spawner.spawn(root)?;
        record.action = WakeupAction::Started;
        record.pid = Some(pid);
        tracing::info!(project = %project_path, pid, "runner spawned");
    }
    *live += 1;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use steroids_db::queries::sections;
    use steroids_test_utils::{create_global_store, create_project_store};
    use uuid::Uuid;

    use crate::hooks::RecordingSink;

    struct FakeSpawner {
        spawned: Mutex<Vec<String>>,
    }

    impl FakeSpawner {
        fn new() -> Self {
            Self {
                spawned: Mutex::new(Vec::new()),
            }
        }
    }

    impl RunnerSpawner for FakeSpawner {
        fn spawn(&self, project_path: &Path) -> Result<u32> {
            self.spawned
                .lock()
                .unwrap()
                .push(project_path.to_string_lossy().to_string());
            Ok(4242)
        }
    }

    async fn seed_pending_task(pool: &SqlitePool) {
        let section = steroids_db::models::section_id("PLAN.md", "s");
        sections::upsert_section(pool, &section, "s", 0, 50, None)
            .await
            .unwrap();
        task_db::insert_task(pool, "work", Some(&section), 0, 50, None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn spawns_runner_for_project_with_pending_work() {
        let global = create_global_store().await;
        let project = create_project_store().await;
        let path = project.project_root().to_string_lossy().to_string();

        project_db::register_project(&global.pool, &path, "proj").await.unwrap();
        seed_pending_task(&project.pool).await;

        let sink = RecordingSink::new();
        let spawner = FakeSpawner::new();
        let results = run_wakeup(&WakeupParams {
            global_paths: &global.paths,
            global_pool: &global.pool,
            sink: &sink,
            spawner: &spawner,
            dry_run: false,
            auto_migrate: true,
            stale_timeout: chrono::Duration::minutes(5),
            max_concurrent: 4,
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, WakeupAction::Started);
        assert_eq!(results[0].pid, Some(4242));
        assert_eq!(spawner.spawned.lock().unwrap().as_slice(), [path]);
    }

    #[tokio::test]
    async fn dry_run_reports_would_start() {
        let global = create_global_store().await;
        let project = create_project_store().await;
        let path = project.project_root().to_string_lossy().to_string();

        project_db::register_project(&global.pool, &path, "proj").await.unwrap();
        seed_pending_task(&project.pool).await;

        let sink = RecordingSink::new();
        let spawner = FakeSpawner::new();
        let results = run_wakeup(&WakeupParams {
            global_paths: &global.paths,
            global_pool: &global.pool,
            sink: &sink,
            spawner: &spawner,
            dry_run: true,
            auto_migrate: true,
            stale_timeout: chrono::Duration::minutes(5),
            max_concurrent: 4,
        })
        .await
        .unwrap();

        assert_eq!(results[0].action, WakeupAction::WouldStart);
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_pending_work_means_no_spawn() {
        let global = create_global_store().await;
        let project = create_project_store().await;
        let path = project.project_root().to_string_lossy().to_string();
        project_db::register_project(&global.pool, &path, "proj").await.unwrap();

        let sink = RecordingSink::new();
        let spawner = FakeSpawner::new();
        let results = run_wakeup(&WakeupParams {
            global_paths: &global.paths,
            global_pool: &global.pool,
            sink: &sink,
            spawner: &spawner,
            dry_run: false,
            auto_migrate: true,
            stale_timeout: chrono::Duration::minutes(5),
            max_concurrent: 4,
        })
        .await
        .unwrap();

        assert_eq!(results[0].action, WakeupAction::None);
        assert_eq!(results[0].reason.as_deref(), Some("no pending work"));
    }

    #[tokio::test]
    async fn live_runner_suppresses_spawn() {
        let global = create_global_store().await;
        let project = create_project_store().await;
        let path = project.project_root().to_string_lossy().to_string();

        project_db::register_project(&global.pool, &path, "proj").await.unwrap();
        seed_pending_task(&project.pool).await;

        // A live runner: our own PID, fresh heartbeat.
        runner_db::insert_runner(&global.pool, Uuid::new_v4(), &path, std::process::id())
            .await
            .unwrap();

        let sink = RecordingSink::new();
        let spawner = FakeSpawner::new();
        let results = run_wakeup(&WakeupParams {
            global_paths: &global.paths,
            global_pool: &global.pool,
            sink: &sink,
            spawner: &spawner,
            dry_run: false,
            auto_migrate: true,
            stale_timeout: chrono::Duration::minutes(5),
            max_concurrent: 4,
        })
        .await
        .unwrap();

        assert_eq!(results[0].action, WakeupAction::None);
        assert_eq!(results[0].reason.as_deref(), Some("active runner present"));
    }

    #[tokio::test]
    async fn missing_directory_is_reported_not_fatal() {
        let global = create_global_store().await;
        project_db::register_project(&global.pool, "/nonexistent/project/path", "ghost")
            .await
            .unwrap();

        let sink = RecordingSink::new();
        let spawner = FakeSpawner::new();
        let results = run_wakeup(&WakeupParams {
            global_paths: &global.paths,
            global_pool: &global.pool,
            sink: &sink,
            spawner: &spawner,
            dry_run: false,
            auto_migrate: true,
            stale_timeout: chrono::Duration::minutes(5),
            max_concurrent: 4,
        })
        .await
        .unwrap();

        assert_eq!(results[0].action, WakeupAction::None);
        assert_eq!(
            results[0].reason.as_deref(),
            Some("project directory missing")
        );
    }

    #[tokio::test]
    async fn stale_runner_rows_are_cleaned() {
        let global = create_global_store().await;
        let project = create_project_store().await;
        let path = project.project_root().to_string_lossy().to_string();
        project_db::register_project(&global.pool, &path, "proj").await.unwrap();

        // A stopped runner row from a previous life.
        let runner = runner_db::insert_runner(&global.pool, Uuid::new_v4(), &path, 1)
            .await
            .unwrap();
        runner_db::set_runner_status(
            &global.pool,
            runner.id,
            steroids_db::models::RunnerStatus::Stopped,
        )
        .await
        .unwrap();

        let sink = RecordingSink::new();
        let spawner = FakeSpawner::new();
        let results = run_wakeup(&WakeupParams {
            global_paths: &global.paths,
            global_pool: &global.pool,
            sink: &sink,
            spawner: &spawner,
            dry_run: true,
            auto_migrate: true,
            stale_timeout: chrono::Duration::minutes(5),
            max_concurrent: 4,
        })
        .await
        .unwrap();

        // Row cleaned; with no pending work the action reports the
        // cleanup.
        assert_eq!(results[0].action, WakeupAction::Cleaned);
        let remaining = runner_db::list_open_runners(&global.pool).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn global_zombie_lock_is_recovered() {
        let global = create_global_store().await;
        let lock_path = global.paths.lock_path();
        std::fs::write(
            &lock_path,
            serde_json::json!({"pid": 0x7fff_fff0, "created_at": Utc::now()}).to_string(),
        )
        .unwrap();

        let sink = RecordingSink::new();
        let spawner = FakeSpawner::new();
        run_wakeup(&WakeupParams {
            global_paths: &global.paths,
            global_pool: &global.pool,
            sink: &sink,
            spawner: &spawner,
            dry_run: true,
            auto_migrate: true,
            stale_timeout: chrono::Duration::minutes(5),
            max_concurrent: 4,
        })
        .await
        .unwrap();

        assert!(!lock_path.exists(), "zombie global lock should be removed");
    }
}
