//! Parallel session lifecycle: partition, clone, execute, merge.
//!
//! [`prepare_session`] partitions the section graph into workstreams,
//! creates one git worktree clone per workstream, and records the
//! session and its lease rows in the global store. [`run_parallel`]
//! executes every workstream concurrently -- each executor claims its
//! lease and drives eligible tasks through the orchestration loop in
//! its own clone -- and finishes by handing the clones to the merge
//! engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use uuid::Uuid;

use steroids_db::models::{ParallelSession, Workstream, WorkstreamStatus};
use steroids_db::queries::{sections, tasks as task_db, workstreams as ws_db};

use crate::lock::lease::WorkstreamLease;
use crate::orchestration::{
    LeaseHandle, OrchestrationContext, OrchestrationError, TaskOutcome, run_task,
};
use crate::scheduler::SectionGraph;

use super::{MergeError, MergeOutcome, MergeParams, run_merge};

/// A prepared parallel session: rows recorded, clones on disk.
#[derive(Debug)]
pub struct PreparedSession {
    pub session: ParallelSession,
    pub workstreams: Vec<Workstream>,
}

/// Partition the project into workstreams and create their clones.
///
/// Components beyond `max_clones` fold into the last workstream in
/// partition order, so the clone count is bounded while every section
/// still runs.
pub async fn prepare_session(
    ctx: &OrchestrationContext,
    global_pool: &sqlx::SqlitePool,
    integration_branch: &str,
    workspace_root: &PathBuf,
    max_clones: usize,
) -> Result<PreparedSession> {
    let section_rows = sections::list_sections(&ctx.pool).await?;
    let dependency_rows = sections::list_dependencies(&ctx.pool).await?;
    let graph = SectionGraph::build(&section_rows, &dependency_rows)?;

    let mut partitions = graph.workstreams()?;
    if partitions.is_empty() {
        bail!("no sections to partition");
    }
    let max_clones = max_clones.max(1);
    if partitions.len() > max_clones {
        let overflow: Vec<_> = partitions.split_off(max_clones);
        let last = partitions.last_mut().expect("at least one partition");
        for extra in overflow {
            last.sections.extend(extra.sections);
        }
    }

    let project_path = ctx.paths.project_root().to_string_lossy().to_string();
    let session = ws_db::insert_session(global_pool, &project_path, integration_branch).await?;

    let mut workstreams = Vec::with_capacity(partitions.len());
    for (index, partition) in partitions.iter().enumerate() {
        let branch = format!("steroids/{}/ws-{index}", session.id.simple());
        let clone_path = workspace_root.join(format!("{}-ws-{index}", session.id.simple()));

        ctx.git
            .create_worktree(&ctx.workdir, &clone_path, &branch)
            .await
            .with_context(|| format!("failed to create clone for workstream {index}"))?;

        let row = ws_db::insert_workstream(
            global_pool,
            session.id,
            &clone_path.to_string_lossy(),
            partition.min_position,
            &partition.sections,
        )
        .await?;
        workstreams.push(row);
    }

    tracing::info!(
        session_id = %session.id,
        workstreams = workstreams.len(),
        "parallel session prepared"
    );
    Ok(PreparedSession { session, workstreams })
}

/// How one workstream executor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkstreamRun {
    Drained,
    Cancelled,
    LeaseLost,
    Failed(String),
}

/// Execute every workstream concurrently, then merge.
///
/// Each executor claims its lease, keeps it fresh through the
/// orchestration loop, and drains the tasks of its sections. Once all
/// executors finish, the merge engine integrates the clones.
pub async fn run_parallel(
    ctx: &OrchestrationContext,
    global_pool: &sqlx::SqlitePool,
    prepared: &PreparedSession,
    integration_branch: &str,
    workspace_root: Option<PathBuf>,
    validation_command: Option<String>,
    cleanup_on_success: bool,
    cleanup_on_failure: bool,
) -> Result<MergeOutcome, MergeError> {
    let mut executors = Vec::with_capacity(prepared.workstreams.len());

    for workstream in &prepared.workstreams {
        let executor_ctx = OrchestrationContext {
            pool: ctx.pool.clone(),
            paths: ctx.paths.clone(),
            config: ctx.config.clone(),
            registry: Arc::clone(&ctx.registry),
            git: Arc::clone(&ctx.git),
            sink: Arc::clone(&ctx.sink),
            cancel: ctx.cancel.clone(),
            lease: None,
            workdir: PathBuf::from(&workstream.clone_path),
        };
        let global_pool = global_pool.clone();
        let workstream_id = workstream.id;
        let section_filter = workstream.parsed_sections();

        executors.push(tokio::spawn(async move {
            run_workstream(executor_ctx, global_pool, workstream_id, section_filter).await
        }));
    }

    for (workstream, executor) in prepared.workstreams.iter().zip(executors) {
        let run = executor
            .await
            .map_err(|e| MergeError::Other(anyhow::anyhow!("executor panicked: {e}")))?;
        match run {
            WorkstreamRun::Drained => {}
            WorkstreamRun::Cancelled => return Ok(MergeOutcome::default()),
            WorkstreamRun::LeaseLost => return Err(MergeError::LeaseFenceFailed),
            WorkstreamRun::Failed(message) => {
                tracing::error!(workstream_id = %workstream.id, %message, "workstream failed");
                ws_db::set_session_status(global_pool, prepared.session.id, WorkstreamStatus::Failed)
                    .await?;
                return Err(MergeError::Other(anyhow::anyhow!(message)));
            }
        }
    }

    let merge_params = MergeParams {
        ctx: OrchestrationContext {
            pool: ctx.pool.clone(),
            paths: ctx.paths.clone(),
            config: ctx.config.clone(),
            registry: Arc::clone(&ctx.registry),
            git: Arc::clone(&ctx.git),
            sink: Arc::clone(&ctx.sink),
            cancel: ctx.cancel.clone(),
            lease: None,
            workdir: ctx.workdir.clone(),
        },
        global_pool: global_pool.clone(),
        session_id: prepared.session.id,
        integration_branch: integration_branch.to_string(),
        holder_id: Uuid::new_v4(),
        workspace_root,
        validation_command,
        cleanup_on_success,
        backoff_unit: Duration::from_secs(60),
    };

    let result = run_merge(&merge_params).await;
    if result.is_err() && cleanup_on_failure {
        super::cleanup_clones(merge_params.workspace_root.as_deref(), &prepared.workstreams);
    }
    result
}

/// One workstream executor: claim the lease, drain eligible tasks.
async fn run_workstream(
    mut ctx: OrchestrationContext,
    global_pool: sqlx::SqlitePool,
    workstream_id: Uuid,
    section_filter: Vec<String>,
) -> WorkstreamRun {
    let runner_id = Uuid::new_v4();
    let lease = match WorkstreamLease::claim(&global_pool, workstream_id, runner_id).await {
        Ok(lease) => lease,
        Err(e) => return WorkstreamRun::Failed(format!("lease claim failed: {e}")),
    };
    ctx.lease = Some(LeaseHandle {
        global_pool: global_pool.clone(),
        lease: lease.clone(),
    });

    loop {
        if ctx.cancel.is_cancelled() {
            return WorkstreamRun::Cancelled;
        }
        if let Err(e) = lease.refresh(&global_pool).await {
            tracing::warn!(error = %e, %workstream_id, "workstream lease lost");
            return WorkstreamRun::LeaseLost;
        }

        let picked = match task_db::next_eligible_task(&ctx.pool, Some(&section_filter), Utc::now())
            .await
        {
            Ok(Some(task)) => Some(task),
            Ok(None) => {
                match task_db::next_review_task(&ctx.pool, Some(&section_filter), Utc::now()).await
                {
                    Ok(picked) => picked,
                    Err(e) => return WorkstreamRun::Failed(format!("task pick failed: {e}")),
                }
            }
            Err(e) => return WorkstreamRun::Failed(format!("task pick failed: {e}")),
        };

        let Some(task) = picked else {
            let _ = lease.release(&global_pool).await;
            return WorkstreamRun::Drained;
        };

        match run_task(&ctx, task.id).await {
            Ok(TaskOutcome::Cancelled) => return WorkstreamRun::Cancelled,
            Ok(_) => {}
            Err(OrchestrationError::LeaseFenced(_)) => return WorkstreamRun::LeaseLost,
            Err(e) => return WorkstreamRun::Failed(format!("task {} failed: {e}", task.id)),
        }
    }
}
