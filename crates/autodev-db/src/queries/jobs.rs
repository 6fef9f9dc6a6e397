//! Database query functions for the `jobs` table -- the durable queue's
//! backing store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never hand
//! the same job to two handlers, while a crashed worker's row lock simply
//! releases back to the queue.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, JobStatus, JobType};

/// NOTIFY channel poked whenever a job becomes claimable.
pub const JOB_NOTIFY_CHANNEL: &str = "autodev_jobs";

/// Insert a job row and wake sleeping workers.
pub async fn enqueue_job(
    pool: &PgPool,
    job_type: JobType,
    task_id: Uuid,
    queue: &str,
    priority: i32,
    max_attempts: i32,
) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (job_type, task_id, queue, priority, max_attempts) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(job_type)
    .bind(task_id)
    .bind(queue)
    .bind(priority)
    .bind(max_attempts)
    .fetch_one(pool)
    .await
    .context("failed to enqueue job")?;

    // Wake-up is best-effort; pollers find the job regardless.
    let _ = sqlx::query("SELECT pg_notify($1, $2)")
        .bind(JOB_NOTIFY_CHANNEL)
        .bind(job.id.to_string())
        .execute(pool)
        .await;

    Ok(job)
}

/// Fetch a job by ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// Claim the next eligible job, if any.
///
/// Picks the highest-weight queued job whose `run_at` has passed, skipping
/// rows locked by other workers, and atomically moves it to `RUNNING` with
/// an incremented attempt counter.
pub async fn claim_next_job(pool: &PgPool) -> Result<Option<Job>> {
    let mut tx = pool.begin().await.context("failed to begin claim transaction")?;

    let candidate = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs \
         WHERE status = 'QUEUED' AND run_at <= NOW() \
         ORDER BY priority DESC, run_at ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .fetch_optional(&mut *tx)
    .await
    .context("failed to select claimable job")?;

    let Some(job) = candidate else {
        tx.rollback().await.ok();
        return Ok(None);
    };

    let claimed = sqlx::query_as::<_, Job>(
        "UPDATE jobs \
         SET status = 'RUNNING', attempt = attempt + 1, claimed_at = NOW() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(job.id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to claim job")?;

    tx.commit().await.context("failed to commit claim")?;
    Ok(Some(claimed))
}

/// Mark a job finished successfully.
pub async fn complete_job(pool: &PgPool, job_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'COMPLETED', finished_at = NOW() \
         WHERE id = $1 AND status = 'RUNNING'",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to complete job")?;

    Ok(result.rows_affected())
}

/// Requeue a failed job for a later attempt.
///
/// Records the handler error and pushes `run_at` to the retry time.
pub async fn requeue_job(
    pool: &PgPool,
    job_id: Uuid,
    run_at: DateTime<Utc>,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'QUEUED', run_at = $1, last_error = $2 \
         WHERE id = $3 AND status = 'RUNNING'",
    )
    .bind(run_at)
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to requeue job")?;

    Ok(result.rows_affected())
}

/// Move an exhausted job to the dead-letter bucket.
pub async fn mark_dead(pool: &PgPool, job_id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'DEAD', finished_at = NOW(), last_error = $1 \
         WHERE id = $2 AND status = 'RUNNING'",
    )
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to mark job dead")?;

    Ok(result.rows_affected())
}

/// Whether a task has a job of the given type still queued or running.
///
/// Used by the repair sweep to re-enqueue work whose original enqueue was
/// lost to a side-effect failure.
pub async fn has_live_job_for_task(
    pool: &PgPool,
    task_id: Uuid,
    job_type: JobType,
) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS( \
             SELECT 1 FROM jobs \
             WHERE task_id = $1 AND job_type = $2 \
               AND status IN ('QUEUED', 'RUNNING') \
         )",
    )
    .bind(task_id)
    .bind(job_type)
    .fetch_one(pool)
    .await
    .context("failed to check live jobs for task")?;

    Ok(row.0)
}

/// Count jobs per status (operator status view).
pub async fn count_by_status(pool: &PgPool, status: JobStatus) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = $1")
        .bind(status)
        .fetch_one(pool)
        .await
        .context("failed to count jobs")?;

    Ok(row.0)
}

/// Reset jobs stuck in `RUNNING` (claimed by a worker that died) back to
/// `QUEUED` once their claim is older than the given age.
pub async fn reset_stuck_jobs(pool: &PgPool, older_than_seconds: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'QUEUED', run_at = NOW() \
         WHERE status = 'RUNNING' \
           AND claimed_at < NOW() - make_interval(secs => $1)",
    )
    .bind(older_than_seconds as f64)
    .execute(pool)
    .await
    .context("failed to reset stuck jobs")?;

    Ok(result.rows_affected())
}
