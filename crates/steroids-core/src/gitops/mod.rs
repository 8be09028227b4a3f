//! The `GitOps` capability -- named git operations behind a trait.
//!
//! The control plane never strings git arguments together inline; every
//! operation it needs is a named method here, implemented by
//! [`CommandGit`] shelling out to `git`. Tests substitute fakes or run
//! against scripted temp repositories.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {message}")]
    Command {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Outcome of a cherry-pick attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPickOutcome {
    /// Commit applied cleanly; the new HEAD sha.
    Applied { new_sha: String },
    /// The pick stopped on conflicts; the conflicted paths.
    Conflict { files: Vec<String> },
}

/// Outcome of `cherry-pick --continue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinueOutcome {
    /// The resolution was committed; the new HEAD sha.
    Committed { new_sha: String },
    /// The resolution left nothing to commit (pick was redundant).
    NothingToCommit,
}

/// Named git operations used by the control plane.
#[async_trait]
pub trait GitOps: Send + Sync {
    /// True when the worktree has no staged or unstaged changes.
    async fn status_clean(&self, repo: &Path) -> Result<bool, GitError>;

    /// Porcelain status text (for judge prompts).
    async fn status_porcelain(&self, repo: &Path) -> Result<String, GitError>;

    /// Stage everything and commit. Returns the new sha, or `None` when
    /// there was nothing to commit.
    async fn commit_all(&self, repo: &Path, message: &str) -> Result<Option<String>, GitError>;

    /// Unified diff of the index against HEAD.
    async fn staged_diff(&self, repo: &Path) -> Result<String, GitError>;

    async fn head_sha(&self, repo: &Path) -> Result<String, GitError>;

    async fn current_branch(&self, repo: &Path) -> Result<Option<String>, GitError>;

    /// Commits on `head` that are not on `base`, oldest first.
    async fn commits_ahead(
        &self,
        repo: &Path,
        base: &str,
        head: &str,
    ) -> Result<Vec<String>, GitError>;

    /// Whether `sha` is an ancestor of (or equal to) HEAD.
    async fn is_reachable_from_head(&self, repo: &Path, sha: &str) -> Result<bool, GitError>;

    /// Full commit message of `sha`.
    async fn commit_message(&self, repo: &Path, sha: &str) -> Result<String, GitError>;

    /// Search the recent log for a commit whose subject contains
    /// `needle`. Returns the newest match.
    async fn find_commit_by_message(
        &self,
        repo: &Path,
        needle: &str,
    ) -> Result<Option<String>, GitError>;

    /// The commit `n` steps behind HEAD (`HEAD~n`), if it exists.
    async fn nth_ancestor(&self, repo: &Path, n: u32) -> Result<Option<String>, GitError>;

    /// Unified diff of one commit against its parent.
    async fn commit_diff(&self, repo: &Path, sha: &str) -> Result<String, GitError>;

    /// Paths touched by one commit.
    async fn changed_files(&self, repo: &Path, sha: &str) -> Result<Vec<String>, GitError>;

    async fn cherry_pick(&self, repo: &Path, sha: &str) -> Result<CherryPickOutcome, GitError>;

    async fn cherry_pick_continue(&self, repo: &Path) -> Result<ContinueOutcome, GitError>;

    async fn cherry_pick_abort(&self, repo: &Path) -> Result<(), GitError>;

    async fn cherry_pick_in_progress(&self, repo: &Path) -> Result<bool, GitError>;

    /// Paths currently staged in the index.
    async fn staged_files(&self, repo: &Path) -> Result<Vec<String>, GitError>;

    /// Paths still unmerged after a conflicted pick.
    async fn unmerged_files(&self, repo: &Path) -> Result<Vec<String>, GitError>;

    /// True when staged or working-tree content still carries conflict
    /// markers.
    async fn has_conflict_markers(&self, repo: &Path) -> Result<bool, GitError>;

    async fn push(&self, repo: &Path, remote: &str, branch: &str) -> Result<(), GitError>;

    /// Create a linked worktree at `path` on a new branch `branch`.
    /// Idempotent: an existing worktree already on that branch is kept.
    async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), GitError>;
}

// -----------------------------------------------------------------------
// CommandGit
// -----------------------------------------------------------------------

/// [`GitOps`] implementation shelling out to the `git` binary.
#[derive(Debug, Default, Clone)]
pub struct CommandGit;

impl CommandGit {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, repo: &Path, args: &[&str]) -> Result<std::process::Output, GitError> {
        Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| GitError::Command {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }

    /// Run and require exit 0; returns trimmed stdout.
    async fn run_ok(&self, repo: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(repo, args).await?;
        if !output.status.success() {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn lines_of(s: &str) -> Vec<String> {
    s.lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[async_trait]
impl GitOps for CommandGit {
    async fn status_clean(&self, repo: &Path) -> Result<bool, GitError> {
        let stdout = self.run_ok(repo, &["status", "--porcelain"]).await?;
        Ok(stdout.is_empty())
    }

    async fn status_porcelain(&self, repo: &Path) -> Result<String, GitError> {
        self.run_ok(repo, &["status", "--porcelain"]).await
    }

    async fn commit_all(&self, repo: &Path, message: &str) -> Result<Option<String>, GitError> {
        self.run_ok(repo, &["add", "-A"]).await?;
        if self.run_ok(repo, &["status", "--porcelain"]).await?.is_empty() {
            return Ok(None);
        }
        self.run_ok(repo, &["commit", "-m", message]).await?;
        Ok(Some(self.head_sha(repo).await?))
    }

    async fn staged_diff(&self, repo: &Path) -> Result<String, GitError> {
        self.run_ok(repo, &["diff", "--cached"]).await
    }

    async fn head_sha(&self, repo: &Path) -> Result<String, GitError> {
        self.run_ok(repo, &["rev-parse", "HEAD"]).await
    }

    async fn current_branch(&self, repo: &Path) -> Result<Option<String>, GitError> {
        let branch = self.run_ok(repo, &["branch", "--show-current"]).await?;
        Ok(if branch.is_empty() { None } else { Some(branch) })
    }

    async fn commits_ahead(
        &self,
        repo: &Path,
        base: &str,
        head: &str,
    ) -> Result<Vec<String>, GitError> {
        let range = format!("{base}..{head}");
        let stdout = self.run_ok(repo, &["rev-list", "--reverse", &range]).await?;
        Ok(lines_of(&stdout))
    }

    async fn is_reachable_from_head(&self, repo: &Path, sha: &str) -> Result<bool, GitError> {
        let output = self
            .run(repo, &["merge-base", "--is-ancestor", sha, "HEAD"])
            .await?;
        Ok(output.status.success())
    }

    async fn commit_message(&self, repo: &Path, sha: &str) -> Result<String, GitError> {
        self.run_ok(repo, &["log", "-1", "--format=%B", sha]).await
    }

    async fn find_commit_by_message(
        &self,
        repo: &Path,
        needle: &str,
    ) -> Result<Option<String>, GitError> {
        let stdout = self
            .run_ok(repo, &["log", "-n", "50", "--format=%H %s"])
            .await?;
        for line in stdout.lines() {
            if let Some((sha, subject)) = line.split_once(' ') {
                if subject.contains(needle) {
                    return Ok(Some(sha.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn nth_ancestor(&self, repo: &Path, n: u32) -> Result<Option<String>, GitError> {
        let spec = format!("HEAD~{n}");
        let output = self.run(repo, &["rev-parse", "--verify", &spec]).await?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    async fn commit_diff(&self, repo: &Path, sha: &str) -> Result<String, GitError> {
        // Root commits have no parent; show handles both.
        self.run_ok(repo, &["show", "--format=", sha]).await
    }

    async fn changed_files(&self, repo: &Path, sha: &str) -> Result<Vec<String>, GitError> {
        let stdout = self
            .run_ok(
                repo,
                &["diff-tree", "--no-commit-id", "--name-only", "-r", sha],
            )
            .await?;
        Ok(lines_of(&stdout))
    }

    async fn cherry_pick(&self, repo: &Path, sha: &str) -> Result<CherryPickOutcome, GitError> {
        let output = self.run(repo, &["cherry-pick", sha]).await?;
        if output.status.success() {
            let new_sha = self.head_sha(repo).await?;
            return Ok(CherryPickOutcome::Applied { new_sha });
        }

        let files = self.unmerged_files(repo).await?;
        if !files.is_empty() || self.cherry_pick_in_progress(repo).await? {
            return Ok(CherryPickOutcome::Conflict { files });
        }

        Err(GitError::Exit {
            command: format!("cherry-pick {sha}"),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn cherry_pick_continue(&self, repo: &Path) -> Result<ContinueOutcome, GitError> {
        let output = self
            .run(repo, &["-c", "core.editor=true", "cherry-pick", "--continue"])
            .await?;
        if output.status.success() {
            let new_sha = self.head_sha(repo).await?;
            return Ok(ContinueOutcome::Committed { new_sha });
        }

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        // A fully redundant resolution leaves an empty pick.
        if combined.contains("nothing to commit")
            || combined.contains("The previous cherry-pick is now empty")
        {
            // Clear the in-progress state.
            let _ = self.run(repo, &["cherry-pick", "--skip"]).await;
            return Ok(ContinueOutcome::NothingToCommit);
        }

        Err(GitError::Exit {
            command: "cherry-pick --continue".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: combined,
        })
    }

    async fn cherry_pick_abort(&self, repo: &Path) -> Result<(), GitError> {
        // Aborting with no pick in progress is a no-op.
        let _ = self.run(repo, &["cherry-pick", "--abort"]).await?;
        Ok(())
    }

    async fn cherry_pick_in_progress(&self, repo: &Path) -> Result<bool, GitError> {
        let path = self
            .run_ok(repo, &["rev-parse", "--git-path", "CHERRY_PICK_HEAD"])
            .await?;
        Ok(repo.join(path).exists())
    }

    async fn staged_files(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let stdout = self.run_ok(repo, &["diff", "--cached", "--name-only"]).await?;
        Ok(lines_of(&stdout))
    }

    async fn unmerged_files(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let stdout = self
            .run_ok(repo, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(lines_of(&stdout))
    }

    async fn has_conflict_markers(&self, repo: &Path) -> Result<bool, GitError> {
        for args in [
            &["diff", "--cached"] as &[&str],
            &["diff"],
        ] {
            let stdout = self.run_ok(repo, args).await?;
            if stdout
                .lines()
                .any(|l| l.starts_with("+<<<<<<<") || l.starts_with("+>>>>>>>"))
            {
                return Ok(true);
            }
        }
        // Unmerged paths still count: resolution is not finished.
        Ok(!self.unmerged_files(repo).await?.is_empty())
    }

    async fn push(&self, repo: &Path, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run_ok(repo, &["push", remote, branch]).await?;
        Ok(())
    }

    async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        if path.exists() {
            // Existing checkout on the expected branch is reused.
            if let Ok(Some(current)) = self.current_branch(path).await {
                if current == branch {
                    return Ok(());
                }
            }
            return Err(GitError::Exit {
                command: "worktree add".to_string(),
                code: -1,
                stderr: format!("path {} exists with a different checkout", path.display()),
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GitError::Command {
                message: format!("failed to create {}", parent.display()),
                source: e,
            })?;
        }

        let path_str = path.to_string_lossy().to_string();
        self.run_ok(repo, &["worktree", "add", "-b", branch, &path_str])
            .await?;
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Push retry state
// -----------------------------------------------------------------------

/// Durable git-push retry state at `.steroids/push-state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushState {
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl PushState {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn record_failure(&mut self, error: &str) {
        self.failure_count += 1;
        self.last_error = Some(error.to_string());
        self.last_attempt_at = Some(chrono::Utc::now());
    }

    pub fn record_success(&mut self) {
        *self = Self {
            last_attempt_at: Some(chrono::Utc::now()),
            ..Self::default()
        };
    }
}

/// Push with retry-state bookkeeping. Returns `Ok(true)` on a push,
/// `Ok(false)` when the failure was recorded for a later retry.
pub async fn push_with_state(
    git: &dyn GitOps,
    repo: &Path,
    remote: &str,
    branch: &str,
    state_path: &Path,
    retry_on_failure: bool,
) -> anyhow::Result<bool> {
    let mut state = PushState::load(state_path);
    match git.push(repo, remote, branch).await {
        Ok(()) => {
            state.record_success();
            state.save(state_path)?;
            Ok(true)
        }
        Err(e) if retry_on_failure => {
            tracing::warn!(error = %e, "push failed, recorded for retry");
            state.record_failure(&e.to_string());
            state.save(state_path)?;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
