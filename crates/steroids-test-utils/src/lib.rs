//! Shared test utilities for steroids integration tests.
//!
//! SQLite stores are embedded, so every test gets its own store inside
//! a temp directory -- no external services. The temp dir handles must
//! be held alive for the duration of the test.

use std::path::{Path, PathBuf};
use std::process::Command;

use sqlx::SqlitePool;
use tempfile::TempDir;

use steroids_db::config::{GlobalPaths, ProjectPaths};
use steroids_db::pool;

/// A migrated global store in a temp directory.
pub struct TestGlobalStore {
    pub pool: SqlitePool,
    pub paths: GlobalPaths,
    _dir: TempDir,
}

/// Create a temporary global store with migrations applied.
pub async fn create_global_store() -> TestGlobalStore {
    let dir = TempDir::new().expect("failed to create temp dir");
    let paths = GlobalPaths::at(dir.path());
    let pool = pool::open_global(&paths)
        .await
        .expect("failed to open global store");
    TestGlobalStore {
        pool,
        paths,
        _dir: dir,
    }
}

/// A migrated project store in a temp directory that doubles as the
/// project root.
pub struct TestProjectStore {
    pub pool: SqlitePool,
    pub paths: ProjectPaths,
    _dir: TempDir,
}

impl TestProjectStore {
    pub fn project_root(&self) -> &Path {
        self.paths.project_root()
    }
}

/// Create a temporary project (root dir + migrated `.steroids` store).
pub async fn create_project_store() -> TestProjectStore {
    let dir = TempDir::new().expect("failed to create temp dir");
    let paths = ProjectPaths::new(dir.path());
    let pool = pool::open_project(&paths)
        .await
        .expect("failed to open project store");
    TestProjectStore {
        pool,
        paths,
        _dir: dir,
    }
}

/// A scripted git repository in a temp directory.
pub struct TestRepo {
    pub path: PathBuf,
    _dir: TempDir,
}

impl TestRepo {
    /// Initialize a repo with one commit on `main`.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().to_path_buf();

        git(&path, &["init", "-b", "main"]);
        git(&path, &["config", "user.email", "test@steroids.dev"]);
        git(&path, &["config", "user.name", "Steroids Test"]);

        std::fs::write(path.join("README.md"), "# test repo\n").expect("write failed");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "initial commit"]);

        Self { path, _dir: dir }
    }

    /// Write `content` to `file`, stage and commit it with `message`.
    /// Returns the new commit sha.
    pub fn commit_file(&self, file: &str, content: &str, message: &str) -> String {
        let full = self.path.join(file);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("mkdir failed");
        }
        std::fs::write(&full, content).expect("write failed");
        git(&self.path, &["add", file]);
        git(&self.path, &["commit", "-m", message]);
        self.head_sha()
    }

    /// Create (or reset) a branch at the current HEAD and check it out.
    pub fn checkout_new_branch(&self, name: &str) {
        git(&self.path, &["checkout", "-B", name]);
    }

    pub fn checkout(&self, name: &str) {
        git(&self.path, &["checkout", name]);
    }

    pub fn head_sha(&self) -> String {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.path)
            .output()
            .expect("git rev-parse failed");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Add a linked worktree on a new branch (a workstream clone
    /// sharing the object store).
    pub fn add_worktree(&self, base: &Path, name: &str, branch: &str) -> PathBuf {
        let target = base.join(name);
        let output = Command::new("git")
            .args(["worktree", "add", "-b", branch])
            .arg(&target)
            .current_dir(&self.path)
            .output()
            .expect("git worktree add failed to spawn");
        assert!(
            output.status.success(),
            "git worktree add failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        git(&target, &["config", "user.email", "test@steroids.dev"]);
        git(&target, &["config", "user.name", "Steroids Test"]);
        target
    }

    /// Write, stage, and commit a file inside an arbitrary directory
    /// (worktree or clone). Returns the commit sha.
    pub fn commit_file_in(dir: &Path, file: &str, content: &str, message: &str) -> String {
        let full = dir.join(file);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("mkdir failed");
        }
        std::fs::write(&full, content).expect("write failed");
        git(dir, &["add", file]);
        git(dir, &["commit", "-m", message]);
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .expect("git rev-parse failed");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Clone this repo into a fresh temp dir (a workstream clone).
    pub fn clone_to(&self, base: &Path, name: &str) -> PathBuf {
        let target = base.join(name);
        let output = Command::new("git")
            .arg("clone")
            .arg(&self.path)
            .arg(&target)
            .output()
            .expect("git clone failed");
        assert!(
            output.status.success(),
            "git clone failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        git(&target, &["config", "user.email", "test@steroids.dev"]);
        git(&target, &["config", "user.name", "Steroids Test"]);
        target
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a git command, panicking (with stderr) on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to spawn: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}
