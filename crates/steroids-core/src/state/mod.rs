//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, the audit-entry
//! coupling (every transition writes its audit row in the same
//! transaction), and the rejection cap.

pub mod dispatch;

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use uuid::Uuid;

use steroids_db::models::{Actor, TaskStatus};
use steroids_db::queries::tasks::{self as db, RejectionDetails, TransitionExtras};

/// Maximum rejections a task may accumulate. A rejection that would
/// push past this becomes a dispute instead.
pub const MAX_REJECTIONS: i64 = 15;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending      -> in_progress  (coder_start)
/// in_progress  -> review       (coder_submit)
/// in_progress  -> skipped      (coder_skip)
/// review       -> completed    (reviewer_approve)
/// review       -> in_progress  (reviewer_reject, rejection_count + 1)
/// review       -> disputed     (reviewer_dispute)
/// review       -> skipped      (reviewer_skip)
/// non-terminal -> pending | failed | skipped   (operator_force)
/// ```
pub struct TaskStateMachine;

/// Result of a reviewer rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Rejection recorded; the new rejection number.
    Rejected { rejection_number: i64 },
    /// The cap was reached; the task was disputed instead.
    Disputed,
}

impl TaskStateMachine {
    /// Check whether `from -> to` is an edge in the state graph (not
    /// counting operator force, which has its own rule).
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Review)
                | (TaskStatus::InProgress, TaskStatus::Skipped)
                | (TaskStatus::Review, TaskStatus::Completed)
                | (TaskStatus::Review, TaskStatus::InProgress)
                | (TaskStatus::Review, TaskStatus::Disputed)
                | (TaskStatus::Review, TaskStatus::Skipped)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }

    /// Execute a validated transition with optimistic locking.
    ///
    /// Returns an error if the edge is not legal, the task is missing,
    /// or the current status no longer matches `from`.
    pub async fn transition(
        pool: &SqlitePool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        actor: Actor,
        notes: Option<&str>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for task {task_id}");
        }

        let rows = db::transition_task(
            pool,
            task_id,
            from,
            to,
            actor,
            TransitionExtras {
                notes,
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

        if rows == 0 {
            Self::report_lost_race(pool, task_id, from).await?;
        }

        Ok(())
    }

    /// Reviewer rejection, honoring the cap.
    ///
    /// While `rejection_count < MAX_REJECTIONS` the rejection is
    /// recorded and the task returns to `in_progress`. At the cap the
    /// transition is rewritten to `review -> disputed` and no rejection
    /// row is written.
    pub async fn reject(
        pool: &SqlitePool,
        task_id: Uuid,
        notes: &str,
        reviewer_provider: &str,
        reviewer_model: &str,
    ) -> Result<RejectOutcome> {
        let task = db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;

        if task.rejection_count + 1 > MAX_REJECTIONS {
            Self::transition(
                pool,
                task_id,
                TaskStatus::Review,
                TaskStatus::Disputed,
                Actor::Reviewer,
                Some("rejection cap reached, escalating to dispute"),
            )
            .await?;
            return Ok(RejectOutcome::Disputed);
        }

        let rows = db::transition_task(
            pool,
            task_id,
            TaskStatus::Review,
            TaskStatus::InProgress,
            Actor::Reviewer,
            TransitionExtras {
                notes: Some(notes),
                rejection: Some(RejectionDetails {
                    notes,
                    reviewer_provider,
                    reviewer_model,
                }),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("failed to reject task {task_id}"))?;

        if rows == 0 {
            Self::report_lost_race(pool, task_id, TaskStatus::Review).await?;
        }

        Ok(RejectOutcome::Rejected {
            rejection_number: task.rejection_count + 1,
        })
    }

    /// Operator force: move any non-terminal task to `pending`,
    /// `failed`, or `skipped`.
    pub async fn force(
        pool: &SqlitePool,
        task_id: Uuid,
        to: TaskStatus,
        notes: Option<&str>,
    ) -> Result<()> {
        if !matches!(
            to,
            TaskStatus::Pending | TaskStatus::Failed | TaskStatus::Skipped
        ) {
            bail!("operator force may only target pending, failed, or skipped (got {to})");
        }

        let task = db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;

        if task.status.is_terminal() {
            bail!(
                "cannot force task {task_id}: status {} is terminal",
                task.status
            );
        }

        let rows = db::transition_task(
            pool,
            task_id,
            task.status,
            to,
            Actor::Operator,
            TransitionExtras {
                notes,
                ..Default::default()
            },
        )
        .await?;

        if rows == 0 {
            Self::report_lost_race(pool, task_id, task.status).await?;
        }

        Ok(())
    }

    async fn report_lost_race(
        pool: &SqlitePool,
        task_id: Uuid,
        expected: TaskStatus,
    ) -> Result<()> {
        let task = db::get_task(pool, task_id).await?;
        match task {
            None => bail!("task {task_id} not found"),
            Some(t) => bail!(
                "optimistic lock failed: task {task_id} has status {}, expected {expected}",
                t.status
            ),
        }
    }
}
