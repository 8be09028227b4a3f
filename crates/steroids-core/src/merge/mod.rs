//! Parallel merge engine.
//!
//! Walks the commits of each workstream clone onto the integration
//! branch with `cherry-pick`, checkpointing every position in
//! `merge_progress` so the walk is resumable after any crash. A
//! conflicted pick synthesizes a "merge conflict" task under a
//! dedicated section and drives a coder/reviewer cycle to resolve it,
//! with exponential backoff sliced into heartbeat windows that keep the
//! workstream lease and merge lock fresh.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

use steroids_db::models::{
    MergeItemStatus, ProviderRole, Task, TaskStatus, WorkstreamStatus, section_id,
};
use steroids_db::queries::{
    merge_progress as progress_db, sections, tasks as task_db, workstreams as ws_db,
};

use crate::gitops::{CherryPickOutcome, ContinueOutcome, GitError};
use crate::lock::lease::{LeaseError, MergeLock, WorkstreamLease};
use crate::orchestration::{
    OrchestrationContext, OrchestrationError, prompts,
    verdict::{ReviewDecision, parse_decision_token},
};
use crate::state::dispatch;

pub mod session;

/// Conflict attempts allowed per workstream.
pub const MAX_CONFLICT_ATTEMPTS: i64 = 5;

/// Cap on validation-gate output.
pub const VALIDATION_OUTPUT_CAP: usize = 20 * 1024 * 1024;

/// Name of the dedicated section holding synthesized conflict tasks.
pub const CONFLICT_SECTION_NAME: &str = "merge-conflicts";

/// Backoff slice width: heartbeats stay fresh through long waits.
const BACKOFF_SLICE: Duration = Duration::from_secs(30);

/// Merge failures. The engine prefers preserving state over forcing
/// completion: most errors leave checkpoints intact for a retry.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("integration worktree is dirty")]
    DirtyWorktree,

    #[error("cherry-pick state on disk does not match recorded progress")]
    CherryPickContextLost,

    #[error("workstream {workstream_id} exceeded {MAX_CONFLICT_ATTEMPTS} conflict attempts")]
    ConflictAttemptLimit { workstream_id: Uuid },

    #[error("validation command failed (exit {exit_code:?})")]
    ValidationFailed {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("lease row missing for workstream {0}")]
    LeaseRowMissing(Uuid),

    #[error("lease fence failed")]
    LeaseFenceFailed,

    #[error("no provider configured/registered for {0}")]
    AiConfigMissing(String),

    #[error("provider invocation failed: {0}")]
    AiInvocationFailed(String),

    #[error("provider invocation timed out")]
    AiInvokeTimeout,

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<LeaseError> for MergeError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::RowMissing { workstream_id } => MergeError::LeaseRowMissing(workstream_id),
            LeaseError::FenceFailed { .. } | LeaseError::HeldElsewhere { .. } => {
                MergeError::LeaseFenceFailed
            }
            LeaseError::Db(e) => MergeError::Other(e),
        }
    }
}

impl From<OrchestrationError> for MergeError {
    fn from(e: OrchestrationError) -> Self {
        match e {
            OrchestrationError::ProviderMissing(p) => MergeError::AiConfigMissing(p),
            OrchestrationError::LeaseFenced(_) => MergeError::LeaseFenceFailed,
            other => MergeError::AiInvocationFailed(other.to_string()),
        }
    }
}

/// Parameters for one merge run.
pub struct MergeParams {
    /// Orchestration context whose `workdir` is the integration
    /// worktree and whose pools point at the owning project.
    pub ctx: OrchestrationContext,
    pub global_pool: sqlx::SqlitePool,
    pub session_id: Uuid,
    pub integration_branch: String,
    /// Identity of this merger (fence holder).
    pub holder_id: Uuid,
    /// Clones are only deleted when strictly under this root.
    pub workspace_root: Option<PathBuf>,
    /// Shell command gating each workstream, if configured.
    pub validation_command: Option<String>,
    pub cleanup_on_success: bool,
    /// Backoff unit; production uses one minute, tests shrink it.
    pub backoff_unit: Duration,
}

/// Summary of a completed merge run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts_resolved: usize,
}

/// Run the merge for a session to completion.
pub async fn run_merge(params: &MergeParams) -> Result<MergeOutcome, MergeError> {
    let repo = params.ctx.workdir.clone();
    let merge_lock =
        MergeLock::acquire(&params.global_pool, params.session_id, params.holder_id).await?;

    let result = merge_session(params, &repo, &merge_lock).await;

    if let Err(e) = merge_lock.release(&params.global_pool).await {
        tracing::warn!(error = %e, "failed to release merge lock");
    }
    result
}

async fn merge_session(
    params: &MergeParams,
    repo: &Path,
    merge_lock: &MergeLock,
) -> Result<MergeOutcome, MergeError> {
    let git = params.ctx.git.as_ref();

    // The integration worktree must be clean, unless an in-progress
    // cherry-pick belongs to this session's recorded conflict state.
    let pick_in_progress = git.cherry_pick_in_progress(repo).await?;
    if !git.status_clean(repo).await? && !pick_in_progress {
        return Err(MergeError::DirtyWorktree);
    }

    ws_db::set_session_status(&params.global_pool, params.session_id, WorkstreamStatus::Running)
        .await?;

    let mut outcome = MergeOutcome::default();
    let workstreams = ws_db::list_for_session(&params.global_pool, params.session_id).await?;

    for workstream in &workstreams {
        if matches!(
            workstream.status,
            WorkstreamStatus::Completed | WorkstreamStatus::Failed
        ) {
            continue;
        }
        if params.ctx.cancel.is_cancelled() {
            return Ok(outcome);
        }

        let lease =
            WorkstreamLease::claim(&params.global_pool, workstream.id, params.holder_id).await?;

        merge_workstream(params, repo, merge_lock, &lease, workstream.id, &mut outcome).await?;

        // Optional validation gate between workstreams.
        if let Some(ref command) = params.validation_command {
            run_validation_gate(repo, command).await?;
        }

        ws_db::set_workstream_status(
            &params.global_pool,
            workstream.id,
            lease.generation,
            WorkstreamStatus::Completed,
        )
        .await?;
        lease.release(&params.global_pool).await?;
    }

    ws_db::set_session_status(
        &params.global_pool,
        params.session_id,
        WorkstreamStatus::Completed,
    )
    .await?;

    if params.cleanup_on_success {
        cleanup_clones(params.workspace_root.as_deref(), &workstreams);
    }

    Ok(outcome)
}

async fn merge_workstream(
    params: &MergeParams,
    repo: &Path,
    merge_lock: &MergeLock,
    lease: &WorkstreamLease,
    workstream_id: Uuid,
    outcome: &mut MergeOutcome,
) -> Result<(), MergeError> {
    let git = params.ctx.git.as_ref();
    let workstream = ws_db::get_workstream(&params.global_pool, workstream_id)
        .await?
        .ok_or(MergeError::LeaseRowMissing(workstream_id))?;

    // Commits ahead of the integration branch on the clone's branch,
    // oldest first -- the topological order of their sections.
    let clone_path = PathBuf::from(&workstream.clone_path);
    let commits = git
        .commits_ahead(&clone_path, &params.integration_branch, "HEAD")
        .await?;

    for (position, sha) in commits.iter().enumerate() {
        let position = position as i64;
        if params.ctx.cancel.is_cancelled() {
            return Ok(());
        }

        // Locks stay fresh between commits.
        merge_lock.refresh(&params.global_pool).await?;
        lease.refresh(&params.global_pool).await?;

        let recorded = progress_db::get_progress(
            &params.ctx.pool,
            params.session_id,
            workstream_id,
            position,
        )
        .await?;

        match recorded {
            Some(p) if p.status == MergeItemStatus::Skipped => {
                outcome.skipped += 1;
                continue;
            }
            Some(p) if p.status == MergeItemStatus::Applied => {
                // Idempotence: an applied prefix is never re-picked.
                if let Some(ref applied_sha) = p.applied_commit_sha {
                    if git.is_reachable_from_head(repo, applied_sha).await? {
                        continue;
                    }
                }
                // Recorded applied but not reachable: fall through and
                // re-attempt the pick.
                ws_db::record_reconcile_action(
                    &params.global_pool,
                    workstream_id,
                    "reapply_unreachable",
                )
                .await?;
            }
            Some(p) if p.status == MergeItemStatus::Conflict => {
                if git.cherry_pick_in_progress(repo).await? {
                    // Resume the recorded conflict where the crash left
                    // it.
                    resolve_conflict(params, repo, merge_lock, lease, workstream_id, position, sha)
                        .await?;
                    outcome.conflicts_resolved += 1;
                    continue;
                }
                // Conflict recorded but nothing on disk: the pick was
                // lost; reconcile by retrying it.
                ws_db::record_reconcile_action(
                    &params.global_pool,
                    workstream_id,
                    "conflict_state_cleared",
                )
                .await?;
            }
            _ => {}
        }

        if git.cherry_pick_in_progress(repo).await? {
            // A pick in progress that no recorded conflict explains.
            return Err(MergeError::CherryPickContextLost);
        }

        match git.cherry_pick(repo, sha).await? {
            CherryPickOutcome::Applied { new_sha } => {
                progress_db::upsert_progress(
                    &params.ctx.pool,
                    params.session_id,
                    workstream_id,
                    position,
                    sha,
                    MergeItemStatus::Applied,
                    None,
                    Some(&new_sha),
                )
                .await?;
                outcome.applied += 1;
            }
            CherryPickOutcome::Conflict { files } => {
                tracing::info!(
                    %workstream_id,
                    position,
                    commit = %sha,
                    ?files,
                    "cherry-pick conflict, entering resolution cycle"
                );
                progress_db::upsert_progress(
                    &params.ctx.pool,
                    params.session_id,
                    workstream_id,
                    position,
                    sha,
                    MergeItemStatus::Conflict,
                    None,
                    None,
                )
                .await?;
                resolve_conflict(params, repo, merge_lock, lease, workstream_id, position, sha)
                    .await?;
                outcome.conflicts_resolved += 1;
            }
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Conflict cycle
// -----------------------------------------------------------------------

async fn resolve_conflict(
    params: &MergeParams,
    repo: &Path,
    merge_lock: &MergeLock,
    lease: &WorkstreamLease,
    workstream_id: Uuid,
    position: i64,
    sha: &str,
) -> Result<(), MergeError> {
    let git = params.ctx.git.as_ref();

    loop {
        // Record the attempt up front; crossing the cap blocks the
        // session.
        let attempts = ws_db::record_conflict_attempt(
            &params.global_pool,
            workstream_id,
            Utc::now(),
        )
        .await?;
        if attempts > MAX_CONFLICT_ATTEMPTS {
            ws_db::set_workstream_status(
                &params.global_pool,
                workstream_id,
                lease.generation,
                WorkstreamStatus::Failed,
            )
            .await?;
            ws_db::set_session_status(
                &params.global_pool,
                params.session_id,
                WorkstreamStatus::BlockedConflict,
            )
            .await?;
            return Err(MergeError::ConflictAttemptLimit { workstream_id });
        }

        // Exponential backoff, sliced so heartbeats stay fresh:
        // min(2^(attempts-1), 30) backoff units.
        let units = 1u64 << (attempts - 1).min(62) as u32;
        let wait = params.backoff_unit * units.min(30) as u32;
        backoff_with_heartbeats(params, merge_lock, lease, wait).await?;
        if params.ctx.cancel.is_cancelled() {
            return Ok(());
        }

        let task = conflict_task(params, sha).await?;
        let commit_message = git.commit_message(repo, sha).await?;
        let conflicted = git.unmerged_files(repo).await?;
        let patch = git.commit_diff(repo, sha).await?;

        // Coder: resolve and stage, leaving no conflict markers.
        let coder_prompt =
            prompts::build_conflict_coder_prompt(&commit_message, &conflicted, &patch);
        let coder_outcome = params
            .ctx
            .invoke_role(
                ProviderRole::Coder,
                params.ctx.config.ai.for_role(ProviderRole::Coder),
                Some(&task),
                &coder_prompt,
                None,
            )
            .await
            .map_err(MergeError::from)?;
        if coder_outcome.timed_out {
            return Err(MergeError::AiInvokeTimeout);
        }

        let staged = git.staged_files(repo).await?;
        if staged.is_empty() || git.has_conflict_markers(repo).await? {
            tracing::warn!(
                task_id = %task.id,
                attempts,
                "resolution incomplete (unstaged or markers remain), retrying cycle"
            );
            task_db::bump_failure_count(&params.ctx.pool, task.id).await?;
            continue;
        }

        // Reviewer: explicit APPROVE/REJECT on the staged resolution.
        let staged_diff = git.staged_diff(repo).await?;
        let review_prompt = prompts::build_conflict_reviewer_prompt(&commit_message, &staged_diff);
        let review_outcome = params
            .ctx
            .invoke_role(
                ProviderRole::Reviewer,
                params.ctx.config.ai.for_role(ProviderRole::Reviewer),
                Some(&task),
                &review_prompt,
                None,
            )
            .await
            .map_err(MergeError::from)?;
        if review_outcome.timed_out {
            return Err(MergeError::AiInvokeTimeout);
        }

        match parse_decision_token(&review_outcome.stdout) {
            ReviewDecision::Approve => {
                dispatch::submit_for_review(&params.ctx.pool, task.id, None).await?;
                match git.cherry_pick_continue(repo).await? {
                    ContinueOutcome::Committed { new_sha } => {
                        progress_db::upsert_progress(
                            &params.ctx.pool,
                            params.session_id,
                            workstream_id,
                            position,
                            sha,
                            MergeItemStatus::Applied,
                            Some(task.id),
                            Some(&new_sha),
                        )
                        .await?;
                        dispatch::approve(&params.ctx.pool, task.id, Some("conflict resolved"))
                            .await?;
                    }
                    ContinueOutcome::NothingToCommit => {
                        // Redundant pick: record the skip and close the
                        // task with a note saying so.
                        progress_db::upsert_progress(
                            &params.ctx.pool,
                            params.session_id,
                            workstream_id,
                            position,
                            sha,
                            MergeItemStatus::Skipped,
                            Some(task.id),
                            None,
                        )
                        .await?;
                        dispatch::approve(
                            &params.ctx.pool,
                            task.id,
                            Some("resolution left nothing to commit; commit skipped"),
                        )
                        .await?;
                    }
                }
                ws_db::clear_conflict_state(&params.global_pool, workstream_id).await?;
                return Ok(());
            }
            ReviewDecision::Reject => {
                dispatch::submit_for_review(&params.ctx.pool, task.id, None).await?;
                let reviewer = params.ctx.config.ai.for_role(ProviderRole::Reviewer);
                dispatch::reject(
                    &params.ctx.pool,
                    task.id,
                    &format!("conflict resolution rejected:\n{}", review_outcome.stdout.trim()),
                    &reviewer.provider,
                    &reviewer.model,
                )
                .await?;
                // Loop: next attempt after backoff.
            }
            other => {
                tracing::warn!(
                    decision = %other,
                    "conflict reviewer gave no explicit APPROVE/REJECT, retrying cycle"
                );
            }
        }
    }
}

/// Wait out a backoff in heartbeat-sized slices, refreshing the merge
/// lock and workstream lease through the pause.
async fn backoff_with_heartbeats(
    params: &MergeParams,
    merge_lock: &MergeLock,
    lease: &WorkstreamLease,
    total: Duration,
) -> Result<(), MergeError> {
    let mut remaining = total;
    while !remaining.is_zero() {
        if params.ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let slice = remaining.min(BACKOFF_SLICE);
        tokio::select! {
            _ = tokio::time::sleep(slice) => {}
            _ = params.ctx.cancel.cancelled() => return Ok(()),
        }
        remaining = remaining.saturating_sub(slice);
        merge_lock.refresh(&params.global_pool).await?;
        lease.refresh(&params.global_pool).await?;
    }
    Ok(())
}

/// Create (or reuse an open) merge-conflict task for `sha` under the
/// dedicated section, set `in_progress`.
async fn conflict_task(params: &MergeParams, sha: &str) -> Result<Task, MergeError> {
    let pool = &params.ctx.pool;
    let section = section_id("merge", CONFLICT_SECTION_NAME);
    sections::upsert_section(pool, &section, CONFLICT_SECTION_NAME, 0, 0, None).await?;

    let short = &sha[..sha.len().min(12)];
    let title = format!("Resolve merge conflict for {short}");

    let existing = task_db::list_tasks_for_section(pool, &section)
        .await?
        .into_iter()
        .find(|t| t.title == title && !t.status.is_terminal());

    let task = match existing {
        Some(task) => task,
        None => {
            let task = task_db::insert_task(pool, &title, Some(&section), 0, 0, None, None).await?;
            params
                .ctx
                .emit(crate::hooks::HookKind::TaskCreated {
                    task_id: task.id,
                    title: task.title.clone(),
                })
                .await;
            task
        }
    };

    if task.status == TaskStatus::Pending {
        dispatch::begin_coding(pool, task.id).await?;
    }

    Ok(task_db::get_task(pool, task.id)
        .await?
        .context("conflict task vanished")?)
}

// -----------------------------------------------------------------------
// Validation gate & cleanup
// -----------------------------------------------------------------------

/// Run the configured validation command with a bounded output buffer.
async fn run_validation_gate(repo: &Path, command: &str) -> Result<(), MergeError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(repo)
        .output()
        .await
        .with_context(|| format!("failed to run validation command {command:?}"))?;

    if output.status.success() {
        return Ok(());
    }

    let mut combined = Vec::with_capacity(output.stdout.len() + output.stderr.len());
    combined.extend_from_slice(&output.stdout);
    combined.extend_from_slice(&output.stderr);
    combined.truncate(VALIDATION_OUTPUT_CAP);

    Err(MergeError::ValidationFailed {
        exit_code: output.status.code(),
        output: String::from_utf8_lossy(&combined).to_string(),
    })
}

/// Remove clone directories, but only paths resolving strictly under
/// the configured workspace root.
pub(crate) fn cleanup_clones(
    workspace_root: Option<&Path>,
    workstreams: &[steroids_db::models::Workstream],
) {
    let Some(root) = workspace_root else {
        return;
    };
    let Ok(root) = root.canonicalize() else {
        return;
    };

    for workstream in workstreams {
        let clone = PathBuf::from(&workstream.clone_path);
        let Ok(resolved) = clone.canonicalize() else {
            continue;
        };
        if resolved.starts_with(&root) && resolved != root {
            if let Err(e) = std::fs::remove_dir_all(&resolved) {
                tracing::warn!(path = %resolved.display(), error = %e, "clone cleanup failed");
            }
        } else {
            tracing::warn!(
                path = %resolved.display(),
                "refusing to clean clone outside workspace root"
            );
        }
    }
}
