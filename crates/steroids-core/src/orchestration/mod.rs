//! The orchestration loop: one task through coder, judge, reviewer(s),
//! judge, and the resulting state transition.
//!
//! Two variants: [`run_task`] drives a single task;
//! [`run_section_batch`] runs a whole section's pending tasks through
//! one coder and one reviewer invocation with linearly inflated
//! timeouts. Credit exhaustion never dies here -- it surfaces as
//! [`OrchestrationError::CreditExhausted`] for the runner supervisor to
//! hand to the credit-pause controller.

pub mod prompts;
pub mod verdict;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use steroids_db::config::ProjectPaths;
use steroids_db::models::{InvocationMode, InvocationStatus, ProviderRole, Task, TaskStatus};
use steroids_db::queries::{audit, invocations, sections, tasks as task_db};

use crate::config::{Config, RoleAiConfig};
use crate::gitops::{GitOps, push_with_state};
use crate::hooks::{EventSink, HookEvent, HookKind, emit_best_effort};
use crate::invocation_log::InvocationLogger;
use crate::lock::lease::{LeaseError, WorkstreamLease};
use crate::provider::{InvokeOutcome, InvokeRequest, ProviderErrorKind, ProviderRegistry};
use crate::state::{RejectOutcome, dispatch};

use verdict::{
    CoderAction, CoordinatorAction, ReviewDecision, ReviewerVerdict, combine_reviews,
    fallback_coder_submits, parse_batch_verdicts, parse_coordinator_verdict,
    parse_decision_token, parse_post_coder_verdict, rejections_repeat,
};

/// Extra activity-timeout budget per task in batch mode.
const BATCH_TIMEOUT_PER_TASK: Duration = Duration::from_secs(60);

/// Tail of coder output recorded as the submission note when the judge
/// supplies none.
const SUBMISSION_NOTE_MAX: usize = 1000;

/// Errors that abort the loop for the current task.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Provider reported credit exhaustion; the supervisor must run the
    /// credit-pause protocol and retry.
    #[error("credit exhausted for {role} ({provider}/{model}): {message}")]
    CreditExhausted {
        provider: String,
        model: String,
        role: ProviderRole,
        message: String,
    },

    /// Configured provider has no registered invoker.
    #[error("no invoker registered for provider {0}")]
    ProviderMissing(String),

    /// The workstream lease was fenced out; abort without committing.
    #[error(transparent)]
    LeaseFenced(#[from] LeaseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of one pass over one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Rejected { rejection_number: i64 },
    Disputed,
    Skipped,
    /// Reviewer decision was unclear; the task stays in `review` and is
    /// re-reviewed on the next cycle.
    StayedInReview,
    /// Coder did not submit; task remains `in_progress` for another
    /// attempt.
    NotSubmitted,
    /// The per-task attempt cap was exhausted.
    Failed,
    Cancelled,
}

/// A lease to keep fresh across every invocation inside the loop.
#[derive(Clone)]
pub struct LeaseHandle {
    pub global_pool: SqlitePool,
    pub lease: WorkstreamLease,
}

impl LeaseHandle {
    pub async fn refresh(&self) -> Result<(), LeaseError> {
        self.lease.refresh(&self.global_pool).await
    }
}

/// Shared dependencies for the loop.
pub struct OrchestrationContext {
    pub pool: SqlitePool,
    pub paths: ProjectPaths,
    pub config: Config,
    pub registry: Arc<ProviderRegistry>,
    pub git: Arc<dyn GitOps>,
    pub sink: Arc<dyn EventSink>,
    pub cancel: CancellationToken,
    /// Workstream lease to refresh on every invocation (parallel mode).
    pub lease: Option<LeaseHandle>,
    /// The repository the coder works in (project root or workstream
    /// clone).
    pub workdir: std::path::PathBuf,
}

impl OrchestrationContext {
    fn role_config(&self, role: ProviderRole) -> &RoleAiConfig {
        self.config.ai.for_role(role)
    }

    pub(crate) async fn emit(&self, kind: HookKind) {
        let project = self.paths.project_root().to_string_lossy().to_string();
        emit_best_effort(self.sink.as_ref(), HookEvent::new(project, kind)).await;
    }

    /// Run one provider invocation with full bookkeeping: invocation
    /// row, activity logger, lease refresh, classification.
    pub async fn invoke_role(
        &self,
        role: ProviderRole,
        role_config: &RoleAiConfig,
        task: Option<&Task>,
        prompt: &str,
        timeout_override: Option<Duration>,
    ) -> Result<InvokeOutcome, OrchestrationError> {
        if let Some(ref lease) = self.lease {
            lease.refresh().await?;
        }

        let invoker = self
            .registry
            .get(&role_config.provider)
            .ok_or_else(|| OrchestrationError::ProviderMissing(role_config.provider.clone()))?;

        let model = if role_config.model.is_empty() {
            invoker.default_model().to_string()
        } else {
            role_config.model.clone()
        };

        // Reuse a session when one exists for the same task, role,
        // provider, and model.
        let resume_session = match task {
            Some(task) => {
                invocations::find_resumable_session(
                    &self.pool,
                    task.id,
                    role,
                    &role_config.provider,
                    &model,
                )
                .await
                .map_err(OrchestrationError::Other)?
            }
            None => None,
        };
        let mode = if resume_session.is_some() {
            InvocationMode::Resume
        } else {
            InvocationMode::Fresh
        };

        let invocation_id = Uuid::new_v4();
        let started_at_ms = Utc::now().timestamp_millis();
        invocations::insert_invocation(
            &self.pool,
            &invocations::NewInvocation {
                id: invocation_id,
                task_id: task.map(|t| t.id),
                role,
                provider: &role_config.provider,
                model: &model,
                prompt,
                started_at_ms,
                mode,
                resumed_from_session_id: resume_session.as_deref(),
                rejection_number: task.map(|t| t.rejection_count).filter(|&n| n > 0),
            },
        )
        .await
        .map_err(OrchestrationError::Other)?;

        let logger = InvocationLogger::spawn(&self.paths, invocation_id, Some(self.pool.clone()))
            .map_err(OrchestrationError::Other)?;

        let timeout = timeout_override
            .unwrap_or_else(|| self.config.runners.subprocess_hang_timeout.get());

        let request = InvokeRequest {
            prompt: prompt.to_string(),
            model: model.clone(),
            cwd: self.workdir.clone(),
            role,
            timeout,
            stream_output: false,
            resume_session_id: resume_session,
            provider_home: Some(self.paths.provider_home(&role_config.provider)),
            activity: Some(logger.sender.clone()),
        };

        let invoke_result = invoker.invoke(request).await;
        logger.finish().await;

        let outcome = invoke_result
            .with_context(|| format!("{role} invocation failed to launch"))
            .map_err(OrchestrationError::Other)?;

        let status = if outcome.timed_out {
            InvocationStatus::Timeout
        } else if outcome.success {
            InvocationStatus::Completed
        } else {
            InvocationStatus::Failed
        };
        let token_usage_json = outcome
            .token_usage
            .and_then(|u| serde_json::to_string(&u).ok());
        invocations::complete_invocation(
            &self.pool,
            invocation_id,
            &invocations::InvocationCompletion {
                status,
                completed_at_ms: Utc::now().timestamp_millis(),
                exit_code: outcome.exit_code.map(i64::from),
                duration_ms: outcome.duration.as_millis() as i64,
                stdout: &outcome.stdout,
                stderr: &outcome.stderr,
                success: outcome.success,
                timed_out: outcome.timed_out,
                session_id: outcome.session_id.as_deref(),
                token_usage: token_usage_json.as_deref(),
            },
        )
        .await
        .map_err(OrchestrationError::Other)?;

        if invoker.classify_result(&outcome) == Some(ProviderErrorKind::CreditExhaustion) {
            return Err(OrchestrationError::CreditExhausted {
                provider: role_config.provider.clone(),
                model,
                role,
                message: format!("{}\n{}", outcome.stderr, outcome.stdout),
            });
        }

        Ok(outcome)
    }
}

// -----------------------------------------------------------------------
// Single-task loop
// -----------------------------------------------------------------------

/// Drive one task through a full coder/review cycle.
pub async fn run_task(
    ctx: &OrchestrationContext,
    task_id: Uuid,
) -> Result<TaskOutcome, OrchestrationError> {
    if ctx.cancel.is_cancelled() {
        return Ok(TaskOutcome::Cancelled);
    }

    let mut task = task_db::get_task(&ctx.pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    // A task already waiting in review skips straight to the reviewer.
    if task.status == TaskStatus::Review {
        return review_task(ctx, &task, false).await;
    }

    if task.status == TaskStatus::Pending {
        dispatch::begin_coding(&ctx.pool, task.id).await?;
        ctx.emit(HookKind::TaskUpdated {
            task_id: task.id,
            from_status: TaskStatus::Pending.to_string(),
            to_status: TaskStatus::InProgress.to_string(),
        })
        .await;
        task.status = TaskStatus::InProgress;
    }

    // Coordinator intervention: repeated rejections redirect the coder.
    let rejections = audit::list_rejections_for_task(&ctx.pool, task.id).await?;
    let mut guidance: Option<String> = None;
    let mut override_reviewer = false;
    if task.rejection_count >= 3 {
        let notes: Vec<String> = rejections.iter().map(|r| r.notes.clone()).collect();
        if rejections_repeat(&notes) {
            let prompt = prompts::build_coordinator_prompt(&task, &rejections);
            let outcome = ctx
                .invoke_role(
                    ProviderRole::Orchestrator,
                    ctx.role_config(ProviderRole::Orchestrator),
                    Some(&task),
                    &prompt,
                    None,
                )
                .await?;
            match parse_coordinator_verdict(&outcome.stdout) {
                Some(v) => {
                    tracing::info!(task_id = %task.id, action = ?v.action, "coordinator decided");
                    match v.action {
                        CoordinatorAction::GuideCoder | CoordinatorAction::NarrowScope => {
                            guidance = Some(v.guidance);
                        }
                        CoordinatorAction::OverrideReviewer => override_reviewer = true,
                    }
                }
                None => {
                    tracing::warn!(task_id = %task.id, "coordinator response unparseable, ignoring");
                }
            }
        }
    }

    // Coder phase. A reusable session for the same provider/model
    // switches the prompt to the resume delta.
    let coder_config = ctx.role_config(ProviderRole::Coder);
    let resuming = invocations::find_resumable_session(
        &ctx.pool,
        task.id,
        ProviderRole::Coder,
        &coder_config.provider,
        &coder_config.model,
    )
    .await?
    .is_some();
    let coder_prompt = prompts::build_coder_prompt(
        &task,
        &prompts::CoderContext {
            resuming,
            rejections: &rejections,
            guidance: guidance.as_deref(),
        },
    );
    let coder_outcome = ctx
        .invoke_role(
            ProviderRole::Coder,
            ctx.role_config(ProviderRole::Coder),
            Some(&task),
            &coder_prompt,
            None,
        )
        .await?;

    if ctx.cancel.is_cancelled() {
        return Ok(TaskOutcome::Cancelled);
    }

    // Post-coder judge.
    let git_status = ctx
        .git
        .status_porcelain(&ctx.workdir)
        .await
        .context("failed to read git status")?;
    let judge_prompt =
        prompts::build_post_coder_judge_prompt(&task, &coder_outcome.stdout, &git_status);
    let judge_outcome = ctx
        .invoke_role(
            ProviderRole::Orchestrator,
            ctx.role_config(ProviderRole::Orchestrator),
            Some(&task),
            &judge_prompt,
            None,
        )
        .await?;

    let parsed = parse_post_coder_verdict(&judge_outcome.stdout);
    let (submits, stage_first) = match &parsed {
        Some(v) if v.action != CoderAction::Error => {
            (v.submits(), v.action == CoderAction::StageCommitSubmit)
        }
        // Parse failure or explicit error: keyword fallback on the
        // coder's own output, which refuses on any negating phrase.
        _ => (fallback_coder_submits(&coder_outcome.stdout), false),
    };

    if !submits {
        let failures = task_db::bump_failure_count(&ctx.pool, task.id).await?;
        if failures >= i64::from(attempt_cap(ctx)) {
            dispatch::mark_failed(&ctx.pool, task.id, "attempt cap exhausted without submission")
                .await?;
            ctx.emit(HookKind::TaskFailed {
                task_id: task.id,
                reason: "attempt cap exhausted".to_string(),
            })
            .await;
            return Ok(TaskOutcome::Failed);
        }
        return Ok(TaskOutcome::NotSubmitted);
    }

    if stage_first {
        ctx.git
            .commit_all(&ctx.workdir, &task.title)
            .await
            .context("failed to stage and commit coder work")?;
    }

    let note = parsed
        .as_ref()
        .and_then(|v| v.metadata.as_ref())
        .and_then(|m| m.get("note"))
        .and_then(|n| n.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| tail(&coder_outcome.stdout, SUBMISSION_NOTE_MAX));

    dispatch::submit_for_review(&ctx.pool, task.id, Some(&note)).await?;
    ctx.emit(HookKind::TaskUpdated {
        task_id: task.id,
        from_status: TaskStatus::InProgress.to_string(),
        to_status: TaskStatus::Review.to_string(),
    })
    .await;

    let task = task_db::get_task(&ctx.pool, task.id)
        .await?
        .with_context(|| format!("task {task_id} vanished mid-loop"))?;
    review_task(ctx, &task, override_reviewer).await
}

fn attempt_cap(ctx: &OrchestrationContext) -> u32 {
    ctx.config.health.max_recovery_attempts.max(1)
}

// -----------------------------------------------------------------------
// Review phase
// -----------------------------------------------------------------------

/// Reviewer panel, post-reviewer judge, and the resulting transition.
async fn review_task(
    ctx: &OrchestrationContext,
    task: &Task,
    override_reviewer: bool,
) -> Result<TaskOutcome, OrchestrationError> {
    if ctx.cancel.is_cancelled() {
        return Ok(TaskOutcome::Cancelled);
    }

    // Locate the commit under review: match the commit message against
    // the task title, else assume HEAD.
    let commit = match ctx.git.find_commit_by_message(&ctx.workdir, &task.title).await {
        Ok(Some(sha)) => sha,
        _ => ctx
            .git
            .head_sha(&ctx.workdir)
            .await
            .context("failed to resolve commit under review")?,
    };
    let diff = ctx
        .git
        .commit_diff(&ctx.workdir, &commit)
        .await
        .context("failed to read diff under review")?;
    let changed_files = ctx
        .git
        .changed_files(&ctx.workdir, &commit)
        .await
        .context("failed to list changed files")?;

    let rejections = audit::list_rejections_for_task(&ctx.pool, task.id).await?;
    let submission_note = audit::latest_submission_note(&ctx.pool, task.id).await?;

    let review_prompt = prompts::build_reviewer_prompt(
        task,
        &prompts::ReviewContext {
            diff: &diff,
            changed_files: &changed_files,
            rejections: &rejections,
            submission_note: submission_note.as_ref().map(|n| n.notes.as_str()),
        },
    );

    // Invoke every configured reviewer in parallel; join on the slowest.
    let panel = ctx.config.ai.reviewer_panel();
    let panel_invocations = panel.iter().map(|reviewer_config| {
        ctx.invoke_role(
            ProviderRole::Reviewer,
            reviewer_config,
            Some(task),
            &review_prompt,
            None,
        )
    });
    let outcomes = futures::future::join_all(panel_invocations).await;

    let mut verdicts = Vec::with_capacity(panel.len());
    for (reviewer_config, outcome) in panel.iter().zip(outcomes) {
        let outcome = outcome?;
        let mut decision = parse_decision_token(&outcome.stdout);

        // No explicit token in the reviewer output: the post-reviewer
        // judge extracts one (or answers unclear).
        if decision == ReviewDecision::Unclear {
            let judge_prompt = prompts::build_post_reviewer_judge_prompt(task, &outcome.stdout);
            let judge_outcome = ctx
                .invoke_role(
                    ProviderRole::Orchestrator,
                    ctx.role_config(ProviderRole::Orchestrator),
                    Some(task),
                    &judge_prompt,
                    None,
                )
                .await?;
            decision = parse_decision_token(&judge_outcome.stdout);
        }

        verdicts.push(ReviewerVerdict {
            decision,
            notes: tail(&outcome.stdout, 4000),
            provider: reviewer_config.provider.clone(),
            model: reviewer_config.model.clone(),
        });
    }

    let combined = combine_reviews(&verdicts);
    let mut decision = combined.decision;

    // The cap forces a dispute regardless of the panel.
    if task.rejection_count >= crate::state::MAX_REJECTIONS {
        decision = ReviewDecision::Dispute;
    } else if override_reviewer && decision == ReviewDecision::Reject {
        tracing::info!(task_id = %task.id, "coordinator override: treating rejection as approval");
        decision = ReviewDecision::Approve;
    }

    match decision {
        ReviewDecision::Approve => {
            dispatch::approve(&ctx.pool, task.id, None).await?;
            ctx.emit(HookKind::TaskUpdated {
                task_id: task.id,
                from_status: TaskStatus::Review.to_string(),
                to_status: TaskStatus::Completed.to_string(),
            })
            .await;
            ctx.emit(HookKind::TaskCompleted { task_id: task.id }).await;
            maybe_push(ctx).await;
            emit_completion_events(ctx, task).await?;
            Ok(TaskOutcome::Completed)
        }
        ReviewDecision::Reject => {
            let notes = merge_rejection_notes(ctx, task, &combined.rejection_notes).await;
            let primary = &panel[0];
            let outcome =
                dispatch::reject(&ctx.pool, task.id, &notes, &primary.provider, &primary.model)
                    .await?;
            match outcome {
                RejectOutcome::Rejected { rejection_number } => {
                    ctx.emit(HookKind::TaskUpdated {
                        task_id: task.id,
                        from_status: TaskStatus::Review.to_string(),
                        to_status: TaskStatus::InProgress.to_string(),
                    })
                    .await;
                    Ok(TaskOutcome::Rejected { rejection_number })
                }
                RejectOutcome::Disputed => {
                    ctx.emit(HookKind::DisputeCreated { task_id: task.id }).await;
                    Ok(TaskOutcome::Disputed)
                }
            }
        }
        ReviewDecision::Dispute => {
            dispatch::dispute(&ctx.pool, task.id, None).await?;
            ctx.emit(HookKind::DisputeCreated { task_id: task.id }).await;
            // Push is allowed on dispute so humans can inspect the work.
            maybe_push(ctx).await;
            Ok(TaskOutcome::Disputed)
        }
        ReviewDecision::Skip => {
            dispatch::skip_by_reviewer(&ctx.pool, task.id, None).await?;
            ctx.emit(HookKind::TaskUpdated {
                task_id: task.id,
                from_status: TaskStatus::Review.to_string(),
                to_status: TaskStatus::Skipped.to_string(),
            })
            .await;
            emit_completion_events(ctx, task).await?;
            Ok(TaskOutcome::Skipped)
        }
        ReviewDecision::Unclear => {
            tracing::info!(task_id = %task.id, "review decision unclear, staying in review");
            Ok(TaskOutcome::StayedInReview)
        }
    }
}

/// With two or more rejections the orchestrator merges the notes into a
/// single checklist; on any failure fall back to concatenation.
async fn merge_rejection_notes(
    ctx: &OrchestrationContext,
    task: &Task,
    notes: &[String],
) -> String {
    if notes.len() < 2 {
        return notes.first().cloned().unwrap_or_default();
    }

    let prompt = prompts::build_merge_rejections_prompt(task, notes);
    match ctx
        .invoke_role(
            ProviderRole::Orchestrator,
            ctx.role_config(ProviderRole::Orchestrator),
            Some(task),
            &prompt,
            None,
        )
        .await
    {
        Ok(outcome) if outcome.success && !outcome.stdout.trim().is_empty() => {
            outcome.stdout.trim().to_string()
        }
        _ => notes.join("\n"),
    }
}

async fn maybe_push(ctx: &OrchestrationContext) {
    if !ctx.config.git.auto_push {
        return;
    }
    let branch = match &ctx.config.git.branch {
        Some(branch) => branch.clone(),
        None => match ctx.git.current_branch(&ctx.workdir).await {
            Ok(Some(branch)) => branch,
            _ => {
                tracing::warn!("auto_push enabled but no branch resolvable, skipping push");
                return;
            }
        },
    };

    let result = push_with_state(
        ctx.git.as_ref(),
        &ctx.workdir,
        &ctx.config.git.remote,
        &branch,
        &ctx.paths.push_state_path(),
        ctx.config.git.retry_on_failure,
    )
    .await;
    if let Err(e) = result {
        tracing::warn!(error = %e, "push failed");
    }
}

/// Emit `section.completed` / `project.completed` when the approve or
/// skip just closed out the section or the whole project.
async fn emit_completion_events(
    ctx: &OrchestrationContext,
    task: &Task,
) -> Result<(), OrchestrationError> {
    if let Some(ref section_id) = task.section_id {
        if sections::section_is_complete(&ctx.pool, section_id).await? {
            ctx.emit(HookKind::SectionCompleted {
                section_id: section_id.clone(),
            })
            .await;
        }
    }
    if task_db::count_pending_work(&ctx.pool).await? == 0 {
        ctx.emit(HookKind::ProjectCompleted).await;
    }
    Ok(())
}

fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while start < trimmed.len() && !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

// -----------------------------------------------------------------------
// Batch variant
// -----------------------------------------------------------------------

/// Run a whole section's pending tasks through one coder invocation and
/// one reviewer invocation. Timeouts scale linearly with the task
/// count.
pub async fn run_section_batch(
    ctx: &OrchestrationContext,
    section_id: &str,
) -> Result<Vec<(Uuid, TaskOutcome)>, OrchestrationError> {
    let section = sections::get_section(&ctx.pool, section_id)
        .await?
        .with_context(|| format!("section {section_id} not found"))?;

    let tasks: Vec<Task> = task_db::list_tasks_for_section(&ctx.pool, section_id)
        .await?
        .into_iter()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
        .collect();

    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    // Linear inflation, capped by the section budget.
    let timeout = (ctx.config.runners.subprocess_hang_timeout.get()
        + BATCH_TIMEOUT_PER_TASK * tasks.len() as u32)
        .min(ctx.config.locking.section_timeout.get());

    for task in &tasks {
        if task.status == TaskStatus::Pending {
            dispatch::begin_coding(&ctx.pool, task.id).await?;
        }
    }

    // One coder invocation for the whole section.
    let coder_prompt = prompts::build_batch_coder_prompt(&section.name, &tasks);
    let coder_outcome = ctx
        .invoke_role(
            ProviderRole::Coder,
            ctx.role_config(ProviderRole::Coder),
            None,
            &coder_prompt,
            Some(timeout),
        )
        .await?;

    if ctx.cancel.is_cancelled() {
        return Ok(tasks.iter().map(|t| (t.id, TaskOutcome::Cancelled)).collect());
    }

    // Per task: a commit matching the title means it was delivered.
    let mut in_review = Vec::new();
    let mut results: Vec<(Uuid, TaskOutcome)> = Vec::new();
    for task in &tasks {
        let committed = ctx
            .git
            .find_commit_by_message(&ctx.workdir, &task.title)
            .await
            .ok()
            .flatten()
            .is_some();
        let submits = committed && {
            // The batch fallback still refuses on negating keywords in
            // the coder's report about this batch, commit or not.
            parse_post_coder_verdict(&coder_outcome.stdout)
                .map(|v| v.submits())
                .unwrap_or_else(|| fallback_coder_submits(&coder_outcome.stdout))
        };
        if submits {
            dispatch::submit_for_review(&ctx.pool, task.id, None).await?;
            in_review.push(task.clone());
        } else {
            task_db::bump_failure_count(&ctx.pool, task.id).await?;
            results.push((task.id, TaskOutcome::NotSubmitted));
        }
    }

    if in_review.is_empty() {
        return Ok(results);
    }

    // One reviewer invocation for everything submitted.
    let review_prompt = prompts::build_batch_reviewer_prompt(&section.name, &in_review);
    let reviewer_outcome = ctx
        .invoke_role(
            ProviderRole::Reviewer,
            ctx.role_config(ProviderRole::Reviewer),
            None,
            &review_prompt,
            Some(timeout),
        )
        .await?;

    // Batch post-judge: per-task verdict list, required as JSON.
    let judge_prompt = prompts::build_batch_judge_prompt(&in_review, &reviewer_outcome.stdout);
    let judge_outcome = ctx
        .invoke_role(
            ProviderRole::Orchestrator,
            ctx.role_config(ProviderRole::Orchestrator),
            None,
            &judge_prompt,
            Some(timeout),
        )
        .await?;

    let expected: Vec<Uuid> = in_review.iter().map(|t| t.id).collect();
    let verdicts = parse_batch_verdicts(&judge_outcome.stdout, &expected);
    let reviewer_config = ctx.role_config(ProviderRole::Reviewer).clone();

    for ((task_id, decision, notes), task) in verdicts.into_iter().zip(in_review.iter()) {
        let forced = task.rejection_count >= crate::state::MAX_REJECTIONS;
        let decision = if forced { ReviewDecision::Dispute } else { decision };

        let outcome = match decision {
            ReviewDecision::Approve => {
                dispatch::approve(&ctx.pool, task_id, notes.as_deref()).await?;
                ctx.emit(HookKind::TaskCompleted { task_id }).await;
                TaskOutcome::Completed
            }
            ReviewDecision::Reject => {
                let note_text = notes.unwrap_or_else(|| "rejected in batch review".to_string());
                match dispatch::reject(
                    &ctx.pool,
                    task_id,
                    &note_text,
                    &reviewer_config.provider,
                    &reviewer_config.model,
                )
                .await?
                {
                    RejectOutcome::Rejected { rejection_number } => {
                        TaskOutcome::Rejected { rejection_number }
                    }
                    RejectOutcome::Disputed => TaskOutcome::Disputed,
                }
            }
            ReviewDecision::Dispute => {
                dispatch::dispute(&ctx.pool, task_id, notes.as_deref()).await?;
                ctx.emit(HookKind::DisputeCreated { task_id }).await;
                TaskOutcome::Disputed
            }
            ReviewDecision::Skip => {
                dispatch::skip_by_reviewer(&ctx.pool, task_id, notes.as_deref()).await?;
                TaskOutcome::Skipped
            }
            ReviewDecision::Unclear => TaskOutcome::StayedInReview,
        };
        results.push((task_id, outcome));
    }

    maybe_push(ctx).await;
    Ok(results)
}
