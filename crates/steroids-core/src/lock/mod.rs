//! Project lock: at most one runner per project.
//!
//! The lock is a JSON file at `.steroids/steroids.lock` created with
//! `O_CREAT|O_EXCL`, paired with PID-liveness probing. A lock file
//! whose recorded PID is dead is a *zombie* and is removed before one
//! retry; a live holder yields [`LockError::Held`].

pub mod lease;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from project lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock held by live pid {pid}")]
    Held { pid: u32 },

    #[error("lock io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFileContents {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

/// True when `pid` names a live process on this host.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 probes existence without delivering anything.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Read a lock file, if present and parseable.
pub fn probe(path: &Path) -> Option<LockFileContents> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Remove a lock file whose recorded PID is dead. Returns `true` when a
/// zombie was cleaned up. An unparseable lock file is treated as a
/// zombie: its owner cannot be probed, so it cannot be trusted.
pub fn recover_zombie(path: &Path) -> Result<bool, LockError> {
    if !path.exists() {
        return Ok(false);
    }
    let dead = match probe(path) {
        Some(contents) => !pid_alive(contents.pid),
        None => true,
    };
    if dead {
        std::fs::remove_file(path).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        warn!(path = %path.display(), "removed zombie lock file");
    }
    Ok(dead)
}

/// An acquired project lock. Dropping it removes the file best-effort;
/// call [`ProjectLock::release`] for a checked release.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl ProjectLock {
    /// Acquire the lock at `path`.
    ///
    /// On finding an existing file, probes its PID: a dead holder is
    /// recovered and acquisition retried exactly once; a live holder
    /// fails with [`LockError::Held`].
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        match Self::try_create(path) {
            Ok(lock) => Ok(lock),
            Err(LockError::Held { pid }) if !pid_alive(pid) => {
                recover_zombie(path)?;
                Self::try_create(path)
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let pid = std::process::id();
        let contents = LockFileContents {
            pid,
            created_at: Utc::now(),
        };

        // O_CREAT|O_EXCL: creation and existence-check are one atomic op.
        let create = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path);

        match create {
            Ok(file) => {
                serde_json::to_writer(&file, &contents).map_err(|e| LockError::Io {
                    path: path.to_path_buf(),
                    source: e.into(),
                })?;
                info!(path = %path.display(), pid, "project lock acquired");
                Ok(Self {
                    path: path.to_path_buf(),
                    pid,
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder_pid = probe(path).map(|c| c.pid).unwrap_or(0);
                Err(LockError::Held { pid: holder_pid })
            }
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Release the lock, removing the file only if we still own it.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Someone may have zombie-recovered and re-acquired; never
        // delete a lock we no longer own.
        if probe(&self.path).map(|c| c.pid) == Some(self.pid) {
            std::fs::remove_file(&self.path).map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;
            info!(path = %self.path.display(), "project lock released");
        }
        Ok(())
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}
