//! Fence-token leases for workstreams and the merge lock.
//!
//! A lease handle remembers the `claim_generation` it was granted
//! under; every refresh re-asserts that generation in the UPDATE's
//! WHERE clause. Once an operator (or recovery) reclaims the row the
//! generation is bumped, so a superseded holder's next refresh affects
//! zero rows and it must abort immediately.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use steroids_db::queries::workstreams;

/// Errors from lease operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The lease row no longer matches our generation/owner: we have
    /// been fenced out and must not touch the workstream again.
    #[error("lease fence failed for workstream {workstream_id}")]
    FenceFailed { workstream_id: Uuid },

    /// The lease row is missing entirely. On any doubt, abort.
    #[error("lease row missing for workstream {workstream_id}")]
    RowMissing { workstream_id: Uuid },

    /// Another holder's lease is still live.
    #[error("workstream {workstream_id} is leased by another runner")]
    HeldElsewhere { workstream_id: Uuid },

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// An acquired workstream lease.
#[derive(Debug, Clone)]
pub struct WorkstreamLease {
    pub workstream_id: Uuid,
    pub runner_id: Uuid,
    pub generation: i64,
}

impl WorkstreamLease {
    /// Claim the lease on a workstream.
    ///
    /// Tries a plain refresh first (unowned row, or a row we already
    /// own); if that fails because another owner's lease expired,
    /// reclaims by bumping the generation.
    pub async fn claim(
        pool: &SqlitePool,
        workstream_id: Uuid,
        runner_id: Uuid,
    ) -> Result<Self, LeaseError> {
        let now = Utc::now();
        let workstream = workstreams::get_workstream(pool, workstream_id)
            .await?
            .ok_or(LeaseError::RowMissing { workstream_id })?;

        let generation = workstream.claim_generation;

        let rows = workstreams::refresh_lease(pool, workstream_id, generation, runner_id, now)
            .await?;
        if rows > 0 {
            return Ok(Self {
                workstream_id,
                runner_id,
                generation,
            });
        }

        // Owned by someone else; reclaim only works on an expired lease.
        match workstreams::reclaim_lease(pool, workstream_id, generation, runner_id, now).await? {
            Some(updated) => Ok(Self {
                workstream_id,
                runner_id,
                generation: updated.claim_generation,
            }),
            None => Err(LeaseError::HeldElsewhere { workstream_id }),
        }
    }

    /// Refresh the lease. A failed refresh means we lost the fence and
    /// the current task must be aborted without committing anything.
    pub async fn refresh(&self, pool: &SqlitePool) -> Result<(), LeaseError> {
        let rows = workstreams::refresh_lease(
            pool,
            self.workstream_id,
            self.generation,
            self.runner_id,
            Utc::now(),
        )
        .await?;

        if rows == 0 {
            return Err(LeaseError::FenceFailed {
                workstream_id: self.workstream_id,
            });
        }
        Ok(())
    }

    /// Graceful release: expire the lease immediately so the next
    /// claimant does not wait out the TTL. Failing the fence here is
    /// fine -- someone else already took over.
    pub async fn release(self, pool: &SqlitePool) -> Result<(), LeaseError> {
        let rows = sqlx::query(
            "UPDATE workstreams SET lease_expires_at = $1, runner_id = NULL \
             WHERE id = $2 AND claim_generation = $3 AND runner_id = $4",
        )
        .bind(Utc::now())
        .bind(self.workstream_id)
        .bind(self.generation)
        .bind(self.runner_id)
        .execute(pool)
        .await
        .map_err(|e| LeaseError::Db(e.into()))?
        .rows_affected();

        if rows == 0 {
            tracing::debug!(
                workstream_id = %self.workstream_id,
                "lease already superseded at release"
            );
        }
        Ok(())
    }
}

/// An acquired merge lock (one merger per project per session).
#[derive(Debug, Clone)]
pub struct MergeLock {
    pub session_id: Uuid,
    pub holder_id: Uuid,
    pub generation: i64,
}

impl MergeLock {
    /// Acquire the merge lock for a session, stealing an expired grant.
    pub async fn acquire(
        pool: &SqlitePool,
        session_id: Uuid,
        holder_id: Uuid,
    ) -> Result<Self, LeaseError> {
        let generation =
            workstreams::acquire_merge_lock(pool, session_id, holder_id, Utc::now())
                .await?
                .ok_or(LeaseError::HeldElsewhere {
                    workstream_id: session_id,
                })?;

        Ok(Self {
            session_id,
            holder_id,
            generation,
        })
    }

    /// Refresh the grant; refreshed between commits and on every
    /// conflict-resolution cycle.
    pub async fn refresh(&self, pool: &SqlitePool) -> Result<(), LeaseError> {
        let rows = workstreams::refresh_merge_lock(
            pool,
            self.session_id,
            self.holder_id,
            self.generation,
            Utc::now(),
        )
        .await?;

        if rows == 0 {
            return Err(LeaseError::FenceFailed {
                workstream_id: self.session_id,
            });
        }
        Ok(())
    }

    pub async fn release(self, pool: &SqlitePool) -> Result<(), LeaseError> {
        workstreams::release_merge_lock(pool, self.session_id, self.holder_id).await?;
        Ok(())
    }
}
