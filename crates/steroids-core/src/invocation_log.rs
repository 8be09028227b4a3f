//! Invocation activity logging.
//!
//! The provider's `activity` channel is a hot path, so the logger owns
//! the file handles: chunks are sent over an unbounded channel to a
//! dedicated task that appends a JSONL activity stream at
//! `.steroids/invocations/<id>.log`, mirrors a human-readable line into
//! the daily log directory, and throttles `last_activity_at_ms` bumps
//! into the invocation row. Daily logs are kept for seven days.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use steroids_db::config::ProjectPaths;
use steroids_db::queries::invocations;

use crate::provider::{ActivityChunk, OutputStream};

/// Days of human-readable daily logs to retain.
pub const LOG_RETENTION_DAYS: i64 = 7;

/// Minimum gap between `last_activity_at_ms` writes.
const ACTIVITY_WRITE_GAP_MS: i64 = 1000;

#[derive(Serialize)]
struct ActivityRecord<'a> {
    at_ms: i64,
    stream: &'static str,
    line: &'a str,
}

/// A running logger task for one invocation.
pub struct InvocationLogger {
    pub sender: mpsc::UnboundedSender<ActivityChunk>,
    handle: JoinHandle<()>,
}

impl InvocationLogger {
    /// Spawn the logger for `invocation_id`. When `pool` is given, the
    /// invocation row's activity timestamp is bumped (throttled) as
    /// chunks arrive.
    pub fn spawn(
        paths: &ProjectPaths,
        invocation_id: Uuid,
        pool: Option<SqlitePool>,
    ) -> Result<Self> {
        let stream_path = paths.invocation_log_path(&invocation_id.to_string());
        let daily_path = daily_log_path(paths, invocation_id, Utc::now());

        for path in [&stream_path, &daily_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let mut stream_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stream_path)
            .with_context(|| format!("failed to open {}", stream_path.display()))?;
        let mut daily_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&daily_path)
            .with_context(|| format!("failed to open {}", daily_path.display()))?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<ActivityChunk>();

        let handle = tokio::spawn(async move {
            let mut last_db_touch: i64 = 0;

            while let Some(chunk) = receiver.recv().await {
                let stream_name = match chunk.stream {
                    OutputStream::Stdout => "stdout",
                    OutputStream::Stderr => "stderr",
                };

                let record = ActivityRecord {
                    at_ms: chunk.at_ms,
                    stream: stream_name,
                    line: &chunk.line,
                };
                if let Ok(json) = serde_json::to_string(&record) {
                    let _ = writeln!(stream_file, "{json}");
                }

                let clock = DateTime::from_timestamp_millis(chunk.at_ms)
                    .unwrap_or_else(Utc::now)
                    .format("%H:%M:%S");
                let _ = writeln!(daily_file, "[{clock}] [{stream_name}] {}", chunk.line);

                if let Some(ref pool) = pool {
                    if chunk.at_ms - last_db_touch >= ACTIVITY_WRITE_GAP_MS {
                        last_db_touch = chunk.at_ms;
                        if let Err(e) =
                            invocations::touch_activity(pool, invocation_id, chunk.at_ms).await
                        {
                            tracing::warn!(error = %e, "failed to touch invocation activity");
                        }
                    }
                }
            }

            let _ = stream_file.flush();
            let _ = daily_file.flush();
        });

        Ok(Self { sender, handle })
    }

    /// Close the channel and wait for the logger to flush.
    pub async fn finish(self) {
        drop(self.sender);
        let _ = self.handle.await;
    }
}

fn daily_log_path(paths: &ProjectPaths, invocation_id: Uuid, now: DateTime<Utc>) -> PathBuf {
    paths
        .daily_log_dir(now.date_naive())
        .join(format!("{invocation_id}.log"))
}

/// Delete daily log directories older than [`LOG_RETENTION_DAYS`].
pub fn sweep_old_logs(paths: &ProjectPaths, now: DateTime<Utc>) -> Result<usize> {
    let logs_dir = paths.logs_dir();
    let Ok(entries) = std::fs::read_dir(&logs_dir) else {
        return Ok(0);
    };

    let cutoff = now.date_naive() - chrono::Duration::days(LOG_RETENTION_DAYS);
    let mut removed = 0;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok(date) = chrono::NaiveDate::parse_from_str(name, "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff {
            std::fs::remove_dir_all(entry.path())
                .with_context(|| format!("failed to remove {}", entry.path().display()))?;
            removed += 1;
        }
    }

    Ok(removed)
}
