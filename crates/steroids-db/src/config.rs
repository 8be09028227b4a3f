//! Store path resolution.
//!
//! The global store lives under `~/.steroids/` (overridable via the
//! `STEROIDS_HOME` env var); each registered project carries its own
//! store and working files under `<project>/.steroids/`.

use std::path::{Path, PathBuf};

/// Name of the per-project (and global) state directory.
pub const STATE_DIR_NAME: &str = ".steroids";

/// Filename of the SQLite database inside a state directory.
pub const DB_FILE_NAME: &str = "steroids.db";

/// Filename of the project lock file inside a state directory.
pub const LOCK_FILE_NAME: &str = "steroids.lock";

/// Layout of the global state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalPaths {
    root: PathBuf,
}

impl GlobalPaths {
    /// Resolve the global state directory: `$STEROIDS_HOME` if set,
    /// otherwise `~/.steroids`.
    pub fn resolve() -> Self {
        let root = std::env::var_os("STEROIDS_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(STATE_DIR_NAME)
            });
        Self { root }
    }

    /// Use an explicit root directory (tests, `--home` overrides).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE_NAME)
    }
}

/// Layout of a project's `.steroids/` state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    project_root: PathBuf,
}

impl ProjectPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR_NAME)
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join(DB_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE_NAME)
    }

    /// JSONL activity stream for one invocation.
    pub fn invocation_log_path(&self, invocation_id: &str) -> PathBuf {
        self.state_dir()
            .join("invocations")
            .join(format!("{invocation_id}.log"))
    }

    /// Directory of human-readable logs for one calendar day.
    pub fn daily_log_dir(&self, date: chrono::NaiveDate) -> PathBuf {
        self.state_dir()
            .join("logs")
            .join(date.format("%Y-%m-%d").to_string())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    /// Git push retry state.
    pub fn push_state_path(&self) -> PathBuf {
        self.state_dir().join("push-state.json")
    }

    /// Isolated home directory for one LLM provider.
    pub fn provider_home(&self, provider: &str) -> PathBuf {
        self.state_dir().join("provider-homes").join(provider)
    }

    /// True once the project store exists on disk.
    pub fn is_initialized(&self) -> bool {
        self.db_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_paths_at_explicit_root() {
        let paths = GlobalPaths::at("/tmp/steroids-home");
        assert_eq!(paths.db_path(), PathBuf::from("/tmp/steroids-home/steroids.db"));
        assert_eq!(
            paths.lock_path(),
            PathBuf::from("/tmp/steroids-home/steroids.lock")
        );
    }

    #[test]
    fn project_paths_layout() {
        let paths = ProjectPaths::new("/work/repo");
        assert_eq!(paths.state_dir(), PathBuf::from("/work/repo/.steroids"));
        assert_eq!(
            paths.db_path(),
            PathBuf::from("/work/repo/.steroids/steroids.db")
        );
        assert_eq!(
            paths.invocation_log_path("abc123"),
            PathBuf::from("/work/repo/.steroids/invocations/abc123.log")
        );
        assert_eq!(
            paths.push_state_path(),
            PathBuf::from("/work/repo/.steroids/push-state.json")
        );
        assert_eq!(
            paths.provider_home("claude"),
            PathBuf::from("/work/repo/.steroids/provider-homes/claude")
        );
    }

    #[test]
    fn daily_log_dir_uses_iso_date() {
        let paths = ProjectPaths::new("/work/repo");
        let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(
            paths.daily_log_dir(date),
            PathBuf::from("/work/repo/.steroids/logs/2026-03-09")
        );
    }
}
