//! Database query functions for the `pull_requests` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PrStatus, PullRequest};

/// Insert the pull request opened for a task.
///
/// `ON CONFLICT DO NOTHING` keeps job replays from recording a second row;
/// the stored row is returned either way.
pub async fn insert_pull_request(
    pool: &PgPool,
    task_id: Uuid,
    repository: &str,
    number: i64,
    title: &str,
    body: &str,
) -> Result<PullRequest> {
    sqlx::query(
        "INSERT INTO pull_requests (task_id, repository, number, title, body) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (task_id) DO NOTHING",
    )
    .bind(task_id)
    .bind(repository)
    .bind(number)
    .bind(title)
    .bind(body)
    .execute(pool)
    .await
    .context("failed to insert pull request")?;

    get_for_task(pool, task_id)
        .await?
        .context("pull request row missing after insert")
}

/// Fetch the pull request belonging to a task.
pub async fn get_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<PullRequest>> {
    let pr = sqlx::query_as::<_, PullRequest>(
        "SELECT * FROM pull_requests WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch pull request")?;

    Ok(pr)
}

/// List all pull requests still `OPEN` (merge-poll sweep input).
pub async fn list_open(pool: &PgPool) -> Result<Vec<PullRequest>> {
    let prs = sqlx::query_as::<_, PullRequest>(
        "SELECT * FROM pull_requests WHERE status = 'OPEN' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list open pull requests")?;

    Ok(prs)
}

/// Record a remote state change for a pull request.
///
/// Sets `merged_at` when the new status is `MERGED`.
pub async fn update_status(pool: &PgPool, pr_id: Uuid, status: PrStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE pull_requests \
         SET status = $1, updated_at = NOW(), \
             merged_at = CASE WHEN $1 = 'MERGED' THEN NOW() ELSE merged_at END \
         WHERE id = $2",
    )
    .bind(status)
    .bind(pr_id)
    .execute(pool)
    .await
    .context("failed to update pull request status")?;

    Ok(result.rows_affected())
}
