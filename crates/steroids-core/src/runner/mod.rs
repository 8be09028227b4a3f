//! Runner supervisor: the long-lived per-project work loop.
//!
//! One supervisor per project, guarded by the project lock. The loop
//! claims eligible tasks one at a time and hands them to the
//! orchestration loop while a concurrent heartbeat task keeps the
//! runner row and task locks fresh. Uncaught task errors audit the task
//! `failed` and the loop moves on; only lock loss or store corruption
//! ends the process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use steroids_db::config::ProjectPaths;
use steroids_db::models::{RunnerStatus, TaskStatus};
use steroids_db::queries::{runners as runner_db, tasks as task_db};

use crate::config::Config;
use crate::credit::{self, CreditPauseRequest, CreditResolution, Heartbeat};
use crate::gitops::GitOps;
use crate::hooks::EventSink;
use crate::lock::{LockError, ProjectLock};
use crate::orchestration::{
    LeaseHandle, OrchestrationContext, OrchestrationError, TaskOutcome, run_task,
};
use crate::state::TaskStateMachine;

/// Why the supervisor exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    /// No eligible work for `locking.wait_timeout`.
    QueueDrained,
    /// The stop signal fired.
    Stopped,
    /// Once-mode: the single task finished.
    OnceComplete,
    /// Once-mode: credit exhaustion fails immediately.
    CreditFailedOnce,
    /// The workstream lease was fenced out.
    LeaseLost,
}

/// Everything a supervisor needs to run.
pub struct RunnerParams {
    pub global_pool: SqlitePool,
    pub project_pool: SqlitePool,
    pub paths: ProjectPaths,
    pub config: Config,
    pub registry: Arc<crate::provider::ProviderRegistry>,
    pub git: Arc<dyn GitOps>,
    pub sink: Arc<dyn EventSink>,
    pub cancel: CancellationToken,
    /// Process a single task, then exit (`run --once`).
    pub once_mode: bool,
    /// Reload configuration (credit-pause polling).
    pub reload_config: Arc<dyn Fn() -> Result<Config> + Send + Sync>,
    /// Restrict scheduling to these sections (workstream scope).
    pub section_filter: Option<Vec<String>>,
    /// Workstream lease to keep fresh (parallel mode).
    pub lease: Option<LeaseHandle>,
    /// Working directory for the coder (project root or clone).
    pub workdir: std::path::PathBuf,
}

/// Heartbeat shared by the main loop, the timer task, and credit
/// pauses: refreshes the runner row and every task lock we hold.
struct RunnerHeartbeat {
    global_pool: SqlitePool,
    project_pool: SqlitePool,
    runner_id: Uuid,
    task_timeout: Duration,
}

impl RunnerHeartbeat {
    async fn tick(&self) {
        if let Err(e) = runner_db::touch_heartbeat(&self.global_pool, self.runner_id).await {
            tracing::warn!(error = %e, "heartbeat: runner row refresh failed");
        }
        let expires = Utc::now()
            + chrono::TimeDelta::from_std(self.task_timeout).unwrap_or(chrono::TimeDelta::MAX);
        if let Err(e) =
            task_db::refresh_task_locks(&self.project_pool, self.runner_id, expires).await
        {
            tracing::warn!(error = %e, "heartbeat: task lock refresh failed");
        }
    }
}

#[async_trait]
impl Heartbeat for RunnerHeartbeat {
    async fn beat(&self) {
        self.tick().await;
    }
}

/// Run the supervisor to completion.
///
/// Returns [`LockError::Held`] (wrapped) when another live runner holds
/// the project lock.
pub async fn run_runner(params: RunnerParams) -> Result<RunnerExit> {
    let lock_path = params.paths.lock_path();
    let lock = match ProjectLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(LockError::Held { pid }) => {
            return Err(anyhow::anyhow!(LockError::Held { pid }))
                .context("project lock held by a live runner");
        }
        Err(e) => return Err(e).context("failed to acquire project lock"),
    };

    let runner_id = Uuid::new_v4();
    let project_path = params.paths.project_root().to_string_lossy().to_string();
    runner_db::insert_runner(
        &params.global_pool,
        runner_id,
        &project_path,
        std::process::id(),
    )
    .await?;

    tracing::info!(%runner_id, project = %project_path, "runner started");

    let heartbeat = Arc::new(RunnerHeartbeat {
        global_pool: params.global_pool.clone(),
        project_pool: params.project_pool.clone(),
        runner_id,
        task_timeout: params.config.locking.task_timeout.get(),
    });

    // Concurrent heartbeat timer.
    let heartbeat_task = {
        let heartbeat = Arc::clone(&heartbeat);
        let cancel = params.cancel.clone();
        let interval = params.config.runners.heartbeat_interval.get();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => heartbeat.tick().await,
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    let exit = run_loop(&params, runner_id, heartbeat.as_ref()).await;

    // Teardown: stop the heartbeat, mark the row stopped, drop the lock.
    heartbeat_task.abort();
    if let Err(e) =
        runner_db::set_runner_status(&params.global_pool, runner_id, RunnerStatus::Stopped).await
    {
        tracing::warn!(error = %e, "failed to mark runner stopped");
    }
    if let Err(e) = lock.release() {
        tracing::warn!(error = %e, "failed to release project lock");
    }

    tracing::info!(%runner_id, exit = ?exit, "runner exiting");
    exit
}

async fn run_loop(
    params: &RunnerParams,
    runner_id: Uuid,
    heartbeat: &RunnerHeartbeat,
) -> Result<RunnerExit> {
    let mut config = params.config.clone();
    let mut idle = Duration::ZERO;
    let poll_interval = config.locking.poll_interval.get();
    let wait_timeout = config.locking.wait_timeout.get();

    loop {
        if params.cancel.is_cancelled() {
            return Ok(RunnerExit::Stopped);
        }

        // Continuous in-runner recovery pass.
        let project_path = params.paths.project_root().to_string_lossy();
        if let Err(e) = crate::health::run_health_pass(
            &params.project_pool,
            &params.global_pool,
            &project_path,
            &config.health,
            params.sink.as_ref(),
            Utc::now(),
        )
        .await
        {
            tracing::warn!(error = %e, "health pass failed");
        }

        let mut picked = task_db::next_eligible_task(
            &params.project_pool,
            params.section_filter.as_deref(),
            Utc::now(),
        )
        .await?;
        if picked.is_none() {
            // Tasks parked in review by an unclear decision get
            // re-reviewed once nothing else is runnable.
            picked = task_db::next_review_task(
                &params.project_pool,
                params.section_filter.as_deref(),
                Utc::now(),
            )
            .await?;
        }

        let Some(task) = picked else {
            idle += poll_interval;
            if idle >= wait_timeout {
                return Ok(RunnerExit::QueueDrained);
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = params.cancel.cancelled() => {}
            }
            continue;
        };
        idle = Duration::ZERO;

        // Claim the task.
        let expires = Utc::now()
            + chrono::TimeDelta::from_std(config.locking.task_timeout.get())
                .unwrap_or(chrono::TimeDelta::MAX);
        let locked =
            task_db::acquire_task_lock(&params.project_pool, task.id, runner_id, expires).await?;
        if !locked {
            tracing::debug!(task_id = %task.id, "task lock lost to another runner");
            continue;
        }
        runner_db::set_current_task(&params.global_pool, runner_id, Some(task.id)).await?;

        let ctx = OrchestrationContext {
            pool: params.project_pool.clone(),
            paths: params.paths.clone(),
            config: config.clone(),
            registry: Arc::clone(&params.registry),
            git: Arc::clone(&params.git),
            sink: Arc::clone(&params.sink),
            cancel: params.cancel.clone(),
            lease: params.lease.clone(),
            workdir: params.workdir.clone(),
        };

        let result = run_task(&ctx, task.id).await;

        task_db::release_task_lock(&params.project_pool, task.id, runner_id).await?;
        runner_db::set_current_task(&params.global_pool, runner_id, None).await?;

        match result {
            Ok(outcome) => {
                tracing::info!(task_id = %task.id, ?outcome, "task cycle finished");
                if params.once_mode {
                    return Ok(RunnerExit::OnceComplete);
                }
                if outcome == TaskOutcome::Cancelled {
                    return Ok(RunnerExit::Stopped);
                }
            }
            Err(OrchestrationError::CreditExhausted {
                provider,
                model,
                role,
                message,
            }) => {
                let request = CreditPauseRequest {
                    provider,
                    model,
                    role,
                    message,
                    runner_id: Some(runner_id),
                    task_id: Some(task.id),
                    once_mode: params.once_mode,
                    poll_interval: None,
                };
                let pause = credit::pause_until_resolved(
                    &params.project_pool,
                    params.sink.as_ref(),
                    &project_path,
                    request,
                    params.reload_config.as_ref(),
                    &params.cancel,
                    heartbeat,
                )
                .await?;

                match pause.resolution {
                    CreditResolution::ImmediateFail => return Ok(RunnerExit::CreditFailedOnce),
                    CreditResolution::Stopped => return Ok(RunnerExit::Stopped),
                    CreditResolution::ConfigChanged => {
                        // Pick up the new provider/model and retry the
                        // task on the next cycle.
                        match (params.reload_config)() {
                            Ok(fresh) => config = fresh,
                            Err(e) => {
                                tracing::warn!(error = %e, "config reload failed after credit pause")
                            }
                        }
                    }
                }
            }
            Err(OrchestrationError::LeaseFenced(e)) => {
                tracing::warn!(error = %e, task_id = %task.id, "lease fenced out, aborting");
                return Ok(RunnerExit::LeaseLost);
            }
            Err(e) => {
                // Keep the runner alive: audit the task failed and move
                // on to the next one.
                tracing::error!(task_id = %task.id, error = %e, "task cycle errored");
                let fresh = task_db::get_task(&params.project_pool, task.id).await?;
                if let Some(fresh) = fresh {
                    if !fresh.status.is_terminal() {
                        if let Err(audit_err) = TaskStateMachine::force(
                            &params.project_pool,
                            task.id,
                            TaskStatus::Failed,
                            Some(&format!("runner error: {e}")),
                        )
                        .await
                        {
                            tracing::warn!(error = %audit_err, "failed to audit task failure");
                        }
                    }
                }
                if params.once_mode {
                    return Ok(RunnerExit::OnceComplete);
                }
            }
        }
    }
}
