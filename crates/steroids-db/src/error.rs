//! Structured database error categories.
//!
//! Every SQL failure surfaces as a [`DbError`] so callers can decide
//! whether to retry. Only `Busy` is retryable; the retry helper backs
//! off exponentially and gives up after 30 seconds total.

use std::time::Duration;

use thiserror::Error;

/// Category of a database failure.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database file is locked by another writer. Retryable.
    #[error("database busy: {0}")]
    Busy(sqlx::Error),

    /// A constraint (unique, check, foreign key) was violated.
    #[error("constraint violation: {0}")]
    Constraint(sqlx::Error),

    /// Schema-level failure: missing table/column, migration mismatch.
    #[error("schema error: {0}")]
    Schema(sqlx::Error),

    /// Underlying filesystem or driver I/O failure.
    #[error("database io error: {0}")]
    Io(sqlx::Error),
}

impl DbError {
    /// Classify a raw sqlx error into a [`DbError`] category.
    pub fn classify(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                // SQLITE_BUSY = 5, SQLITE_LOCKED = 6.
                if code == "5" || code == "6" || db.message().contains("locked") {
                    DbError::Busy(err)
                } else if db.is_unique_violation()
                    || db.is_check_violation()
                    || db.is_foreign_key_violation()
                {
                    DbError::Constraint(err)
                } else if db.message().contains("no such table")
                    || db.message().contains("no such column")
                {
                    DbError::Schema(err)
                } else {
                    DbError::Io(err)
                }
            }
            sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) => DbError::Schema(err),
            sqlx::Error::PoolTimedOut => DbError::Busy(err),
            _ => DbError::Io(err),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Busy(_))
    }
}

/// Total budget for busy retries.
pub const BUSY_RETRY_BUDGET: Duration = Duration::from_secs(30);

/// Run `op` with exponential backoff on `Busy` errors.
///
/// Starts at 50 ms and doubles up to 3.2 s per wait; gives up once the
/// total elapsed wait would exceed [`BUSY_RETRY_BUDGET`] and returns the
/// last error.
pub async fn retry_busy<T, F, Fut>(mut op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut waited = Duration::ZERO;
    let mut backoff = Duration::from_millis(50);

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let classified = DbError::classify(e);
                if !classified.is_retryable() || waited + backoff > BUSY_RETRY_BUDGET {
                    return Err(classified);
                }
                tracing::debug!(wait_ms = backoff.as_millis() as u64, "database busy, retrying");
                tokio::time::sleep(backoff).await;
                waited += backoff;
                backoff = (backoff * 2).min(Duration::from_millis(3200));
            }
        }
    }
}
