//! Persistence layer for steroids.
//!
//! Two logical stores back the control plane: a *global* store under the
//! user profile (registered projects, the runner registry, parallel
//! sessions and their workstream leases) and a *per-project* store under
//! `<project>/.steroids/` (sections, tasks, audit trail, invocations,
//! incidents, merge checkpoints). Both are embedded SQLite databases
//! opened in WAL mode with a single-writer pool.

pub mod config;
pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
