//! Pick job queue.
//!
//! Two invariants need real synchronization here:
//!
//! * at most one `pending`/`claimed`/`succeeded` job per game, upheld by
//!   [`Database::enqueue_if_absent`] running check-and-insert inside one
//!   immediate transaction, with a partial unique index as the storage-level
//!   backstop;
//! * claim exclusivity, upheld by [`Database::claim_next`] being a single
//!   conditional `UPDATE ... RETURNING`.
//!
//! Both hold under the in-process connection mutex and also across processes
//! sharing the same SQLite file.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::models::{EnqueueOutcome, Game, JobState, PickJob, QueueSnapshot};
use super::Database;
use crate::error::QueueError;

impl Database {
    /// Create a `pending` job for `game` unless one is already active or has
    /// already succeeded. Failed jobs do not block a fresh enqueue.
    pub fn enqueue_if_absent(&self, game: &Game) -> Result<EnqueueOutcome> {
        let now = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let live: Option<JobState> = tx
            .query_row(
                "SELECT state FROM pick_jobs
                 WHERE game_id=?1 AND state IN ('pending','claimed','succeeded')
                 ORDER BY id DESC LIMIT 1",
                params![game.id],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match live {
            Some(JobState::Succeeded) => EnqueueOutcome::AlreadyDone,
            Some(_) => EnqueueOutcome::AlreadyActive,
            None => {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO pick_jobs
                        (game_id, league, state, attempts, enqueued_at, updated_at)
                     VALUES (?1, ?2, 'pending', 0, ?3, ?3)",
                    params![game.id, game.league, now],
                )?;
                if inserted == 1 {
                    EnqueueOutcome::Created
                } else {
                    EnqueueOutcome::AlreadyActive
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Claim the oldest claimable job for `owner`.
    ///
    /// Claimable means `pending`, or `claimed` with a claim older than
    /// `stale_after` (its previous owner is presumed dead). Returns `None`
    /// when nothing is claimable.
    pub fn claim_next(&self, owner: &str, stale_after: Duration) -> Result<Option<PickJob>> {
        self.claim_next_at(owner, Utc::now(), stale_after)
    }

    pub(crate) fn claim_next_at(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Option<PickJob>> {
        let stale_before = now - stale_after;
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!(
                    "UPDATE pick_jobs SET
                        state='claimed',
                        claimed_by=?1,
                        claimed_at=?2,
                        updated_at=?2,
                        last_error=CASE WHEN state='claimed'
                            THEN 'recovered stale claim from ' || COALESCE(claimed_by, 'unknown')
                            ELSE last_error END
                     WHERE id = (
                        SELECT id FROM pick_jobs
                        WHERE state='pending' OR (state='claimed' AND claimed_at < ?3)
                        ORDER BY enqueued_at ASC, id ASC
                        LIMIT 1
                     )
                     AND (state='pending' OR (state='claimed' AND claimed_at < ?3))
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                params![owner, now, stale_before],
                map_job,
            )
            .optional()?;
        Ok(job)
    }

    /// `claimed -> succeeded`, storing the opaque result payload.
    pub fn mark_succeeded(&self, job_id: i64, owner: &str, result_json: &str) -> Result<()> {
        let now = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_claim(&tx, job_id, owner, JobState::Succeeded)?;
        tx.execute(
            "UPDATE pick_jobs SET state='succeeded', result_json=?1, finished_at=?2, updated_at=?2
             WHERE id=?3",
            params![result_json, now, job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// The attempt count is incremented; a retryable failure with
    /// `attempts <= max_retries` re-arms the job to `pending` at the back of
    /// the queue, anything else is terminal `failed`. Returns the new state.
    pub fn mark_failed(
        &self,
        job_id: i64,
        owner: &str,
        error: &str,
        retryable: bool,
        max_retries: u32,
    ) -> Result<JobState> {
        let now = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let attempts = check_claim(&tx, job_id, owner, JobState::Failed)? + 1;

        let next = if retryable && attempts <= max_retries {
            tx.execute(
                "UPDATE pick_jobs SET state='pending', attempts=?1, last_error=?2,
                        claimed_by=NULL, claimed_at=NULL, enqueued_at=?3, updated_at=?3
                 WHERE id=?4",
                params![attempts, error, now, job_id],
            )?;
            JobState::Pending
        } else {
            tx.execute(
                "UPDATE pick_jobs SET state='failed', attempts=?1, last_error=?2,
                        finished_at=?3, updated_at=?3
                 WHERE id=?4",
                params![attempts, error, now, job_id],
            )?;
            JobState::Failed
        };

        tx.commit()?;
        Ok(next)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<PickJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM pick_jobs WHERE id=?1", JOB_COLUMNS),
                params![job_id],
                map_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Most recently touched jobs first.
    pub fn list_jobs(&self, limit: i64) -> Result<Vec<PickJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pick_jobs ORDER BY updated_at DESC, id DESC LIMIT ?1",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![limit], map_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    #[cfg(test)]
    pub fn jobs_for_game(&self, game_id: i64) -> Result<Vec<PickJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pick_jobs WHERE game_id=?1 ORDER BY id ASC",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![game_id], map_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let conn = self.conn()?;
        let mut snapshot = QueueSnapshot::default();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM pick_jobs GROUP BY state")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, JobState>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (state, count) in counts {
            snapshot.total += count;
            match state {
                JobState::Pending => snapshot.pending = count,
                JobState::Claimed => snapshot.claimed = count,
                JobState::Succeeded => snapshot.succeeded = count,
                JobState::Failed => snapshot.failed = count,
            }
        }
        snapshot.oldest_pending_at = conn.query_row(
            "SELECT MIN(enqueued_at) FROM pick_jobs WHERE state='pending'",
            [],
            |row| row.get::<_, Option<DateTime<Utc>>>(0),
        )?;
        Ok(snapshot)
    }
}

/// Verify `job_id` is `claimed` by `owner`; returns its attempt count.
fn check_claim(
    tx: &rusqlite::Transaction<'_>,
    job_id: i64,
    owner: &str,
    to: JobState,
) -> Result<u32> {
    let row: Option<(JobState, Option<String>, u32)> = tx
        .query_row(
            "SELECT state, claimed_by, attempts FROM pick_jobs WHERE id=?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match row {
        None => Err(QueueError::NotFound(job_id).into()),
        Some((JobState::Claimed, Some(claimed_by), attempts)) if claimed_by == owner => Ok(attempts),
        Some((JobState::Claimed, claimed_by, _)) => Err(QueueError::ClaimLost {
            job_id,
            owner: claimed_by,
        }
        .into()),
        Some((from, _, _)) => Err(QueueError::InvalidTransition { job_id, from, to }.into()),
    }
}

const JOB_COLUMNS: &str = "id, game_id, league, state, attempts, last_error, result_json,
        claimed_by, claimed_at, enqueued_at, updated_at, finished_at";

fn map_job(row: &rusqlite::Row) -> rusqlite::Result<PickJob> {
    Ok(PickJob {
        id: row.get(0)?,
        game_id: row.get(1)?,
        league: row.get(2)?,
        state: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        result_json: row.get(6)?,
        claimed_by: row.get(7)?,
        claimed_at: row.get(8)?,
        enqueued_at: row.get(9)?,
        updated_at: row.get(10)?,
        finished_at: row.get(11)?,
    })
}
