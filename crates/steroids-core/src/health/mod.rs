//! Stuck-task detection and bounded auto-recovery.
//!
//! One detection pass classifies anomalies into exactly one failure
//! mode each (evaluated in order: orphaned task, hanging invocation,
//! zombie runner, dead runner, db inconsistency), then applies recovery
//! actions capped by the hourly incident budget. `db_inconsistency` is
//! reported but never auto-recovered.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use steroids_db::models::{Actor, FailureMode, ProviderRole, Runner, TaskStatus};
use steroids_db::queries::{incidents, invocations, runners as runner_db, tasks as task_db};
use steroids_db::queries::tasks::TransitionExtras;

use crate::config::HealthConfig;
use crate::hooks::{EventSink, HookEvent, HookKind, emit_best_effort};
use crate::lock::pid_alive;

/// Grace before a task with zero invocations counts as inconsistent;
/// covers the window between `in_progress` and the first invocation
/// row.
const DB_INCONSISTENCY_GRACE: TimeDelta = TimeDelta::seconds(60);

/// One classified anomaly.
#[derive(Debug, Clone)]
pub struct Finding {
    pub mode: FailureMode,
    pub task_id: Option<Uuid>,
    pub runner_id: Option<Uuid>,
    pub details: serde_json::Value,
}

/// Result of one detection-and-recovery pass.
#[derive(Debug, Default)]
pub struct HealthPassOutcome {
    pub findings: Vec<Finding>,
    /// Human-readable labels of recovery actions taken.
    pub recovered_actions: Vec<String>,
    /// Findings whose recovery was skipped by the hourly safety cap.
    pub skipped_due_to_safety_limit: usize,
}

/// Run one pass: classify, then recover within the safety cap.
pub async fn run_health_pass(
    project_pool: &SqlitePool,
    global_pool: &SqlitePool,
    project_path: &str,
    config: &HealthConfig,
    sink: &dyn EventSink,
    now: DateTime<Utc>,
) -> Result<HealthPassOutcome> {
    let findings = classify(project_pool, global_pool, project_path, config, now).await?;

    let mut outcome = HealthPassOutcome {
        findings: findings.clone(),
        ..Default::default()
    };

    for finding in findings {
        emit_best_effort(
            sink,
            HookEvent::new(
                project_path,
                HookKind::HealthChanged {
                    failure_mode: finding.mode.to_string(),
                    task_id: finding.task_id,
                },
            ),
        )
        .await;

        // db_inconsistency is record-only.
        let recoverable = finding.mode != FailureMode::DbInconsistency;

        if recoverable && config.auto_recover {
            let recent = incidents::count_recent(project_pool, now).await?;
            if recent >= config.max_incidents_per_hour {
                tracing::warn!(
                    mode = %finding.mode,
                    recent,
                    "recovery skipped: hourly incident cap reached"
                );
                outcome.skipped_due_to_safety_limit += 1;
                emit_best_effort(
                    sink,
                    HookEvent::new(
                        project_path,
                        HookKind::HealthCritical {
                            detail: format!(
                                "recovery for {} skipped: {recent} incidents in the last hour",
                                finding.mode
                            ),
                        },
                    ),
                )
                .await;
                continue;
            }
        }

        incidents::insert_incident(
            project_pool,
            finding.task_id,
            finding.runner_id,
            finding.mode,
            &finding.details,
        )
        .await?;

        if !recoverable || !config.auto_recover {
            continue;
        }

        match finding.mode {
            FailureMode::OrphanedTask => {
                if let Some(task_id) = finding.task_id {
                    recover_orphaned_task(project_pool, task_id).await?;
                    outcome
                        .recovered_actions
                        .push(format!("reset orphaned task {task_id}"));
                }
            }
            FailureMode::HangingInvocation => {
                if let Some(runner_id) = finding.runner_id {
                    kill_runner(global_pool, runner_id).await?;
                    outcome
                        .recovered_actions
                        .push(format!("killed runner {runner_id}"));
                }
                if let Some(task_id) = finding.task_id {
                    recover_orphaned_task(project_pool, task_id).await?;
                    outcome
                        .recovered_actions
                        .push(format!("reset hanging task {task_id}"));
                }
            }
            FailureMode::ZombieRunner | FailureMode::DeadRunner => {
                if let Some(runner_id) = finding.runner_id {
                    // Zombies still have a live process to stop first.
                    if finding.mode == FailureMode::ZombieRunner {
                        kill_runner(global_pool, runner_id).await?;
                    } else {
                        runner_db::delete_runner(global_pool, runner_id).await?;
                    }
                    outcome
                        .recovered_actions
                        .push(format!("removed runner row {runner_id}"));
                }
                // Any task that runner held gets the hanging treatment.
                if let Some(task_id) = finding.task_id {
                    recover_orphaned_task(project_pool, task_id).await?;
                    outcome
                        .recovered_actions
                        .push(format!("reset held task {task_id}"));
                }
            }
            FailureMode::DbInconsistency | FailureMode::CreditExhaustion => {}
        }
    }

    Ok(outcome)
}

/// Classify anomalies. Each task and each runner yields at most one
/// finding per pass; tasks claimed by a runner finding are excluded
/// from the task sweep.
async fn classify(
    project_pool: &SqlitePool,
    global_pool: &SqlitePool,
    project_path: &str,
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    let mut claimed_tasks: Vec<Uuid> = Vec::new();

    // Runner sweep first: a broken runner explains its held task, and
    // exclusivity demands one finding per anomaly.
    let open_runners = runner_db::list_open_runners(global_pool).await?;
    let heartbeat_cutoff = now - to_delta(config.runner_heartbeat_timeout.get());

    for runner in &open_runners {
        if runner.project_path != project_path {
            continue;
        }
        let alive = runner.pid.map(|pid| pid_alive(pid as u32)).unwrap_or(false);

        let mode = if !alive {
            Some(FailureMode::DeadRunner)
        } else if runner.heartbeat_at <= heartbeat_cutoff {
            Some(FailureMode::ZombieRunner)
        } else {
            None
        };

        if let Some(mode) = mode {
            if let Some(task_id) = runner.current_task_id {
                claimed_tasks.push(task_id);
            }
            findings.push(Finding {
                mode,
                task_id: runner.current_task_id,
                runner_id: Some(runner.id),
                details: serde_json::json!({
                    "pid": runner.pid,
                    "heartbeat_at": runner.heartbeat_at,
                    "status": runner.status,
                }),
            });
        }
    }

    // Healthy runners, for deciding orphaned vs hanging.
    let active_runners: Vec<&Runner> = open_runners
        .iter()
        .filter(|r| {
            r.project_path == project_path
                && r.heartbeat_at > heartbeat_cutoff
                && r.pid.map(|pid| pid_alive(pid as u32)).unwrap_or(false)
        })
        .collect();

    // Task sweep.
    let stale_cutoff = now - to_delta(config.orphaned_task_timeout.get());
    let stale_tasks = task_db::list_stale_active_tasks(project_pool, stale_cutoff).await?;

    for task in &stale_tasks {
        if claimed_tasks.contains(&task.id) {
            continue;
        }

        let role = match task.status {
            TaskStatus::InProgress => ProviderRole::Coder,
            TaskStatus::Review => ProviderRole::Reviewer,
            _ => continue,
        };

        // The invocation activity stream is the ground truth: a task
        // whose invocation is still chatting is not stuck.
        let last_activity_ms = invocations::latest_activity_for_task(project_pool, task.id)
            .await?
            .unwrap_or(0);
        let last_signal = task
            .updated_at
            .max(DateTime::from_timestamp_millis(last_activity_ms).unwrap_or(task.updated_at));
        if last_signal > stale_cutoff {
            continue;
        }

        let executing_runner = active_runners
            .iter()
            .find(|r| r.current_task_id == Some(task.id));

        match executing_runner {
            Some(runner) => {
                // A live runner but a silent task: the invocation hangs
                // once the per-role duration budget is gone.
                let role_budget = match role {
                    ProviderRole::Coder => config.max_coder_duration.get(),
                    ProviderRole::Reviewer => config.max_reviewer_duration.get(),
                    ProviderRole::Orchestrator => config.max_coder_duration.get(),
                };
                if last_signal <= now - to_delta(role_budget) {
                    findings.push(Finding {
                        mode: FailureMode::HangingInvocation,
                        task_id: Some(task.id),
                        runner_id: Some(runner.id),
                        details: serde_json::json!({
                            "phase": role.to_string(),
                            "last_signal": last_signal,
                        }),
                    });
                }
            }
            None => {
                let running = invocations::list_running_for_task(project_pool, task.id, role)
                    .await?;
                if running.is_empty() {
                    findings.push(Finding {
                        mode: FailureMode::OrphanedTask,
                        task_id: Some(task.id),
                        runner_id: None,
                        details: serde_json::json!({
                            "status": task.status,
                            "last_signal": last_signal,
                        }),
                    });
                }
                // A running invocation with no active runner is left
                // alone this pass; it resolves to orphaned once the
                // invocation record goes terminal.
            }
        }
    }

    // DB-inconsistency sweep: recently active in_progress tasks with no
    // invocation records at all.
    let recent_tasks = task_db::list_all_tasks(project_pool).await?;
    for task in &recent_tasks {
        if task.status != TaskStatus::InProgress || claimed_tasks.contains(&task.id) {
            continue;
        }
        if findings.iter().any(|f| f.task_id == Some(task.id)) {
            continue;
        }
        let recently = task.updated_at > stale_cutoff
            && task.updated_at < now - DB_INCONSISTENCY_GRACE;
        if recently && invocations::count_for_task(project_pool, task.id).await? == 0 {
            findings.push(Finding {
                mode: FailureMode::DbInconsistency,
                task_id: Some(task.id),
                runner_id: None,
                details: serde_json::json!({
                    "reason": "in_progress with zero invocation records",
                }),
            });
        }
    }

    Ok(findings)
}

/// Orphaned-task recovery: clear the lock, reset to `pending`, bump the
/// failure counter. The transition is audited as operator action.
async fn recover_orphaned_task(pool: &SqlitePool, task_id: Uuid) -> Result<()> {
    task_db::clear_task_lock(pool, task_id).await?;

    let Some(task) = task_db::get_task(pool, task_id).await? else {
        return Ok(());
    };
    if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Review) {
        return Ok(());
    }

    let rows = task_db::transition_task(
        pool,
        task_id,
        task.status,
        TaskStatus::Pending,
        Actor::Operator,
        TransitionExtras {
            notes: Some("auto-recovery: task reset to pending"),
            bump_failure_count: true,
            ..Default::default()
        },
    )
    .await?;
    if rows == 0 {
        tracing::debug!(task_id = %task_id, "task moved on before recovery applied");
    }
    Ok(())
}

/// Stop a runner process (SIGTERM, then SIGKILL after five seconds) and
/// delete its registry row.
async fn kill_runner(global_pool: &SqlitePool, runner_id: Uuid) -> Result<()> {
    let runner = runner_db::get_runner(global_pool, runner_id)
        .await?
        .with_context(|| format!("runner {runner_id} not found"))?;

    if let Some(pid) = runner.pid {
        let pid = pid as u32;
        if pid_alive(pid) {
            #[cfg(unix)]
            {
                // SAFETY: signalling a pid we just probed.
                unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            }
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while pid_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if pid_alive(pid) {
                #[cfg(unix)]
                {
                    unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                }
            }
        }
    }

    runner_db::delete_runner(global_pool, runner_id).await?;
    Ok(())
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
