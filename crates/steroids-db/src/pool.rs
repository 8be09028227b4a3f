//! SQLite pool management and schema migration.
//!
//! Every store opens with write-ahead logging and `synchronous=NORMAL`.
//! The writer pool is capped at a single connection so each store has
//! exactly one mutator per process; reporting callers can open a
//! separate read-only pool.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Executor, SqlitePool};
use tracing::info;

use crate::migrations::Migration;

/// Open (and create if missing) a store at `db_path` with the
/// single-writer discipline.
pub async fn open(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create store directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    // Another process may hold the file mid-checkpoint; busy opens are
    // retried with backoff rather than failed outright.
    let pool = crate::error::retry_busy(|| {
        let options = options.clone();
        async move {
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(options)
                .await
        }
    })
    .await
    .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    Ok(pool)
}

/// Open an existing store read-only. Fails if the file is absent.
pub async fn open_read_only(db_path: &Path) -> Result<SqlitePool> {
    if !db_path.exists() {
        bail!("database not found at {}", db_path.display());
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    Ok(pool)
}

/// Current schema version of a store.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64> {
    let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .context("failed to read user_version")?;
    Ok(version)
}

/// Apply any pending migration steps to a store.
///
/// Before the first pending step runs, a point-in-time copy of the
/// database file is written next to it as `<name>.backup-v<current>`.
/// Each step executes inside one transaction and bumps `user_version`.
pub async fn run_migrations(
    pool: &SqlitePool,
    db_path: &Path,
    migrations: &[Migration],
) -> Result<()> {
    let current = schema_version(pool).await?;
    let pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        return Ok(());
    }

    // Backup before touching the schema. A fresh (version 0, no file
    // content yet) store skips this.
    if current > 0 && db_path.exists() {
        let backup = db_path.with_extension(format!("db.backup-v{current}"));
        std::fs::copy(db_path, &backup).with_context(|| {
            format!("failed to back up database to {}", backup.display())
        })?;
        info!(backup = %backup.display(), "pre-migration backup written");
    }

    for migration in pending {
        let mut tx = pool.begin().await.context("failed to begin migration")?;
        tx.execute(migration.sql)
            .await
            .with_context(|| format!("migration to version {} failed", migration.version))?;
        // PRAGMA cannot be parameterised; version comes from a compiled-in table.
        tx.execute(format!("PRAGMA user_version = {}", migration.version).as_str())
            .await
            .context("failed to set user_version")?;
        tx.commit().await.context("failed to commit migration")?;
        info!(version = migration.version, "migration applied");
    }

    Ok(())
}

/// Open the global store and migrate it to the current schema.
pub async fn open_global(paths: &crate::config::GlobalPaths) -> Result<SqlitePool> {
    let db_path = paths.db_path();
    let pool = open(&db_path).await?;
    run_migrations(&pool, &db_path, crate::migrations::GLOBAL_MIGRATIONS).await?;
    Ok(pool)
}

/// Open a project store and migrate it to the current schema.
pub async fn open_project(paths: &crate::config::ProjectPaths) -> Result<SqlitePool> {
    let db_path = paths.db_path();
    let pool = open(&db_path).await?;
    run_migrations(&pool, &db_path, crate::migrations::PROJECT_MIGRATIONS).await?;
    Ok(pool)
}

/// Open a project store that must already exist, optionally migrating.
///
/// When `auto_migrate` is false and the schema is behind, this fails
/// rather than mutating a store the operator has not opted into
/// upgrading (`STEROIDS_AUTO_MIGRATE`).
pub async fn open_project_existing(
    paths: &crate::config::ProjectPaths,
    auto_migrate: bool,
) -> Result<SqlitePool> {
    let db_path = paths.db_path();
    if !db_path.exists() {
        bail!("project not initialized: {} missing", db_path.display());
    }
    let pool = open(&db_path).await?;

    let current = schema_version(&pool).await?;
    let latest = crate::migrations::PROJECT_MIGRATIONS
        .last()
        .map(|m| m.version)
        .unwrap_or(0);

    if current < latest {
        if !auto_migrate {
            bail!(
                "project schema is at version {current}, expected {latest}; \
                 set STEROIDS_AUTO_MIGRATE=1 to migrate on open"
            );
        }
        run_migrations(&pool, &db_path, crate::migrations::PROJECT_MIGRATIONS).await?;
    }

    Ok(pool)
}
