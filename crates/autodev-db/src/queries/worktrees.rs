//! Database query functions for the `worktrees` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Worktree, WorktreeStatus};

/// Insert a worktree row in `CREATING` status.
///
/// The unique constraints reject duplicate paths and a second live
/// worktree for the same `(project, branch)`.
pub async fn insert_worktree(
    pool: &PgPool,
    project_id: Uuid,
    task_id: Uuid,
    branch_name: &str,
    path: &str,
) -> Result<Worktree> {
    let worktree = sqlx::query_as::<_, Worktree>(
        "INSERT INTO worktrees (project_id, task_id, branch_name, path) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(project_id)
    .bind(task_id)
    .bind(branch_name)
    .bind(path)
    .fetch_one(pool)
    .await
    .context("failed to insert worktree")?;

    Ok(worktree)
}

/// Fetch a worktree by ID.
pub async fn get_worktree(pool: &PgPool, id: Uuid) -> Result<Option<Worktree>> {
    let worktree = sqlx::query_as::<_, Worktree>("SELECT * FROM worktrees WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worktree")?;

    Ok(worktree)
}

/// Fetch the task's `ACTIVE` worktree, if any.
pub async fn get_active_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Worktree>> {
    let worktree = sqlx::query_as::<_, Worktree>(
        "SELECT * FROM worktrees WHERE task_id = $1 AND status = 'ACTIVE'",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active worktree")?;

    Ok(worktree)
}

/// Move a worktree between statuses.
pub async fn update_status(
    pool: &PgPool,
    worktree_id: Uuid,
    status: WorktreeStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE worktrees SET status = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(status)
    .bind(worktree_id)
    .execute(pool)
    .await
    .context("failed to update worktree status")?;

    Ok(result.rows_affected())
}

/// Flag a task's live worktree for cleanup.
///
/// Idempotent: affects zero rows when the worktree is already terminal or
/// already flagged.
pub async fn schedule_cleanup(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE worktrees \
         SET status = 'CLEANING', updated_at = NOW() \
         WHERE task_id = $1 AND status IN ('CREATING', 'ACTIVE')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to schedule worktree cleanup")?;

    Ok(result.rows_affected())
}

/// Worktrees eligible for the scheduler's removal sweep: flagged
/// `CLEANING`, or still live while their owning task is terminal and the
/// last update is older than the grace period.
pub async fn list_cleanup_candidates(
    pool: &PgPool,
    grace_seconds: i64,
) -> Result<Vec<Worktree>> {
    let worktrees = sqlx::query_as::<_, Worktree>(
        "SELECT w.* FROM worktrees w \
         JOIN tasks t ON t.id = w.task_id \
         WHERE w.status = 'CLEANING' \
            OR (w.status IN ('CREATING', 'ACTIVE') \
                AND t.status IN ('DONE', 'CANCELLED') \
                AND w.updated_at < NOW() - make_interval(secs => $1)) \
         ORDER BY w.updated_at ASC",
    )
    .bind(grace_seconds as f64)
    .fetch_all(pool)
    .await
    .context("failed to list cleanup candidates")?;

    Ok(worktrees)
}
