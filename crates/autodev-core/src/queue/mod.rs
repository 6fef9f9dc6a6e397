//! Durable job queue: at-least-once delivery of typed jobs to the worker
//! pool, with priority-weighted pick-up, exponential retry, and a
//! dead-letter bucket.
//!
//! The queue rides on the jobs table: enqueue inserts + NOTIFYs, claim
//! uses `FOR UPDATE SKIP LOCKED`. Payloads are minimal (the task id); all
//! richer context is read from storage at dispatch time so jobs stay
//! replay-safe.

pub mod handlers;
pub mod worker;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use autodev_db::models::{Job, JobType};
use autodev_db::queries::jobs as db;

use crate::broker::{self, Event, EventBroker, kinds};
use crate::error::{CoreError, CoreResult};

/// Queue names and their pick-up weights.
pub const QUEUE_CRITICAL: (&str, i32) = ("critical", 6);
pub const QUEUE_PLANNING: (&str, i32) = ("planning", 4);
pub const QUEUE_IMPLEMENTATION: (&str, i32) = ("implementation", 4);
pub const QUEUE_DEFAULT: (&str, i32) = ("default", 1);

/// Retry backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Backoff before attempt `n + 1`: `min(2^n s, 30 s)`.
pub fn backoff_for(attempt: i32) -> Duration {
    let attempt = attempt.clamp(0, 30) as u32;
    Duration::from_secs(2u64.saturating_pow(attempt)).min(MAX_BACKOFF)
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeued for another attempt after the given delay.
    Retried(Duration),
    /// Moved to the dead-letter bucket.
    Dead,
}

/// Handle on the durable queue.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    events: EventBroker,
    max_attempts: i32,
}

impl JobQueue {
    pub fn new(pool: PgPool, events: EventBroker, max_attempts: i32) -> Self {
        Self {
            pool,
            events,
            max_attempts,
        }
    }

    /// Enqueue a planning job for a task.
    pub async fn enqueue_planning(&self, task_id: Uuid) -> CoreResult<Job> {
        let (queue, priority) = QUEUE_PLANNING;
        db::enqueue_job(
            &self.pool,
            JobType::TaskPlanning,
            task_id,
            queue,
            priority,
            self.max_attempts,
        )
        .await
        .map_err(CoreError::external)
    }

    /// Enqueue an implementation job for a task.
    pub async fn enqueue_implementation(&self, task_id: Uuid) -> CoreResult<Job> {
        let (queue, priority) = QUEUE_IMPLEMENTATION;
        db::enqueue_job(
            &self.pool,
            JobType::TaskImplementation,
            task_id,
            queue,
            priority,
            self.max_attempts,
        )
        .await
        .map_err(CoreError::external)
    }

    /// Claim the next eligible job, if any.
    pub async fn claim(&self) -> CoreResult<Option<Job>> {
        db::claim_next_job(&self.pool).await.map_err(CoreError::external)
    }

    /// Mark a claimed job as finished.
    pub async fn complete(&self, job: &Job) -> CoreResult<()> {
        db::complete_job(&self.pool, job.id)
            .await
            .map_err(CoreError::external)?;
        Ok(())
    }

    /// Record a handler failure: requeue with backoff while attempts (or
    /// backpressure) allow, otherwise dead-letter and emit `job_failed`.
    pub async fn fail(&self, job: &Job, err: &CoreError) -> CoreResult<FailureDisposition> {
        let message = err.to_string();

        // Backpressure never consumes the attempt budget; other retryable
        // failures do.
        let should_retry =
            err.is_backpressure() || (err.is_retryable() && job.attempt < job.max_attempts);

        if should_retry {
            let delay = backoff_for(job.attempt);
            let run_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            db::requeue_job(&self.pool, job.id, run_at, &message)
                .await
                .map_err(CoreError::external)?;
            warn!(
                job_id = %job.id,
                task_id = %job.task_id,
                attempt = job.attempt,
                delay_secs = delay.as_secs(),
                error = %message,
                "job failed, retrying"
            );
            return Ok(FailureDisposition::Retried(delay));
        }

        db::mark_dead(&self.pool, job.id, &message)
            .await
            .map_err(CoreError::external)?;
        warn!(
            job_id = %job.id,
            task_id = %job.task_id,
            attempt = job.attempt,
            error = %message,
            "job exhausted, moved to dead letter"
        );

        self.events
            .publish(
                &broker::task_channel(job.task_id),
                &Event::new(
                    kinds::JOB_FAILED,
                    json!({
                        "job_id": job.id,
                        "task_id": job.task_id,
                        "job_type": job.job_type,
                        "attempt": job.attempt,
                        "error": message,
                    }),
                ),
            )
            .await;

        Ok(FailureDisposition::Dead)
    }
}
