use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task in the review state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Review,
    Completed,
    Disputed,
    Skipped,
    Failed,
}

impl TaskStatus {
    /// Terminal states never transition again (except by operator force,
    /// which only applies to non-terminal tasks).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::Failed | Self::Disputed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            "disputed" => Ok(Self::Disputed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Who performed a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Coder,
    Reviewer,
    Orchestrator,
    Coordinator,
    Operator,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Orchestrator => "orchestrator",
            Self::Coordinator => "coordinator",
            Self::Operator => "operator",
        };
        f.write_str(s)
    }
}

impl FromStr for Actor {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "orchestrator" => Ok(Self::Orchestrator),
            "coordinator" => Ok(Self::Coordinator),
            "operator" => Ok(Self::Operator),
            other => Err(ParseEnumError::new("actor", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Role of one provider invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Coder,
    Reviewer,
    Orchestrator,
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Orchestrator => "orchestrator",
        };
        f.write_str(s)
    }
}

impl FromStr for ProviderRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "orchestrator" => Ok(Self::Orchestrator),
            other => Err(ParseEnumError::new("provider role", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Lifecycle status of an invocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for InvocationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(ParseEnumError::new("invocation status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Whether an invocation started a fresh session or resumed a prior one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    Fresh,
    Resume,
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fresh => "fresh",
            Self::Resume => "resume",
        };
        f.write_str(s)
    }
}

impl FromStr for InvocationMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(Self::Fresh),
            "resume" => Ok(Self::Resume),
            other => Err(ParseEnumError::new("invocation mode", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a runner process in the global registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for RunnerStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            other => Err(ParseEnumError::new("runner status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status shared by parallel sessions and their workstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkstreamStatus {
    Pending,
    Running,
    Completed,
    Failed,
    BlockedConflict,
}

impl WorkstreamStatus {
    /// A lease can only be claimed or refreshed while the workstream is
    /// in one of these states.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for WorkstreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::BlockedConflict => "blocked_conflict",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkstreamStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked_conflict" => Ok(Self::BlockedConflict),
            other => Err(ParseEnumError::new("workstream status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Outcome of one commit position in a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MergeItemStatus {
    Applied,
    Skipped,
    Conflict,
}

impl fmt::Display for MergeItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

impl FromStr for MergeItemStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(Self::Applied),
            "skipped" => Ok(Self::Skipped),
            "conflict" => Ok(Self::Conflict),
            other => Err(ParseEnumError::new("merge item status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Classified anomaly recorded as an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    OrphanedTask,
    HangingInvocation,
    ZombieRunner,
    DeadRunner,
    DbInconsistency,
    CreditExhaustion,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OrphanedTask => "orphaned_task",
            Self::HangingInvocation => "hanging_invocation",
            Self::ZombieRunner => "zombie_runner",
            Self::DeadRunner => "dead_runner",
            Self::DbInconsistency => "db_inconsistency",
            Self::CreditExhaustion => "credit_exhaustion",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orphaned_task" => Ok(Self::OrphanedTask),
            "hanging_invocation" => Ok(Self::HangingInvocation),
            "zombie_runner" => Ok(Self::ZombieRunner),
            "dead_runner" => Ok(Self::DeadRunner),
            "db_inconsistency" => Ok(Self::DbInconsistency),
            "credit_exhaustion" => Ok(Self::CreditExhaustion),
            other => Err(ParseEnumError::new("failure mode", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A registered project in the global store. Registration is the
/// authority for "the system should consider this repository".
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub path: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A section -- an ordered group of tasks with a stable hashed id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Section {
    pub id: String,
    pub name: String,
    pub position: i64,
    pub priority: i64,
    pub skipped: bool,
    pub source_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An edge in the section dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SectionDependency {
    pub section_id: String,
    pub depends_on_section_id: String,
}

/// A task -- the unit of work driven through coder/reviewer cycles.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    pub section_id: Option<String>,
    pub position: i64,
    pub priority: i64,
    pub rejection_count: i64,
    pub failure_count: i64,
    pub source_file: Option<String>,
    pub file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Exclusive claim on a task by one runner, with a heartbeat-refreshed
/// expiry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskLock {
    pub task_id: Uuid,
    pub runner_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Append-only record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub task_id: Uuid,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub actor: Actor,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One reviewer rejection, 1-indexed per task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RejectionEntry {
    pub id: i64,
    pub task_id: Uuid,
    pub rejection_number: i64,
    pub notes: String,
    pub reviewer_provider: String,
    pub reviewer_model: String,
    pub created_at: DateTime<Utc>,
}

/// A coder-authored note attached at submission; only the most recent
/// is consumed by the reviewer prompt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubmissionNote {
    pub id: i64,
    pub task_id: Uuid,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

/// Token counts reported by a provider, stored as JSON in the
/// invocation row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One external LLM call. `last_activity_at_ms` is touched on every
/// stdout/stderr chunk and is the ground truth for stuck detection.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invocation {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub role: ProviderRole,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub last_activity_at_ms: Option<i64>,
    pub status: InvocationStatus,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub success: Option<bool>,
    pub timed_out: Option<bool>,
    pub session_id: Option<String>,
    pub resumed_from_session_id: Option<String>,
    pub invocation_mode: InvocationMode,
    pub token_usage: Option<String>,
    pub rejection_number: Option<i64>,
}

impl Invocation {
    pub fn parsed_token_usage(&self) -> Option<TokenUsage> {
        self.token_usage
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// A runner process row in the global registry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Runner {
    pub id: Uuid,
    pub status: RunnerStatus,
    pub pid: Option<i64>,
    pub project_path: String,
    pub current_task_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// A parallel merge session spanning N workstream clones.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ParallelSession {
    pub id: Uuid,
    pub project_path: String,
    pub integration_branch: String,
    pub status: WorkstreamStatus,
    pub created_at: DateTime<Utc>,
}

/// A workstream lease row. Ownership is enforced by the compound
/// condition on `(status, claim_generation, runner_id)`; see the lease
/// queries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workstream {
    pub id: Uuid,
    pub session_id: Uuid,
    pub clone_path: String,
    pub runner_id: Option<Uuid>,
    pub claim_generation: i64,
    pub status: WorkstreamStatus,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub conflict_attempts: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_reconcile_action: Option<String>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub min_position: i64,
    /// Section ids scheduled on this workstream, as a JSON array.
    pub sections: String,
}

impl Workstream {
    pub fn parsed_sections(&self) -> Vec<String> {
        serde_json::from_str(&self.sections).unwrap_or_default()
    }
}

/// Checkpoint for one commit position during a merge. Makes the merge
/// engine resumable after any crash.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MergeProgress {
    pub session_id: Uuid,
    pub workstream_id: Uuid,
    pub position: i64,
    pub commit_sha: String,
    pub status: MergeItemStatus,
    pub conflict_task_id: Option<Uuid>,
    pub applied_commit_sha: Option<String>,
}

/// A durably recorded anomaly.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Incident {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub runner_id: Option<Uuid>,
    pub failure_mode: FailureMode,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Stable section ids
// ---------------------------------------------------------------------------

/// Compute the stable id for a section: the first 16 hex chars of
/// `sha256("<source_file>\n<name>")`. Stable across re-imports of the
/// same plan file.
pub fn section_id(source_file: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_file.as_bytes());
    hasher.update(b"\n");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
