//! Database query functions for the `executions` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Execution, ExecutionStatus, ExecutionType};

/// Insert a new execution row in `PENDING` status.
pub async fn insert_execution(
    pool: &PgPool,
    task_id: Uuid,
    exec_type: ExecutionType,
    worktree_path: &str,
) -> Result<Execution> {
    let execution = sqlx::query_as::<_, Execution>(
        "INSERT INTO executions (task_id, exec_type, worktree_path) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(exec_type)
    .bind(worktree_path)
    .fetch_one(pool)
    .await
    .context("failed to insert execution")?;

    Ok(execution)
}

/// Fetch a single execution by ID.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch execution")?;

    Ok(execution)
}

/// List all executions for a task, oldest first.
pub async fn list_executions_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Execution>> {
    let executions = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list executions for task")?;

    Ok(executions)
}

/// Fetch the task's `RUNNING` execution, if one exists.
///
/// The partial unique index guarantees at most one row matches.
pub async fn get_running_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions WHERE task_id = $1 AND status = 'RUNNING'",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch running execution")?;

    Ok(execution)
}

/// List every `RUNNING` execution (crash-recovery sweep input).
pub async fn list_running(pool: &PgPool) -> Result<Vec<Execution>> {
    let executions = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions WHERE status = 'RUNNING' ORDER BY started_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list running executions")?;

    Ok(executions)
}

/// Count a task's executions of one type, any status.
///
/// The repair sweep uses a zero count to tell a lost enqueue apart from a
/// failed execution awaiting a human decision.
pub async fn count_for_task_by_type(
    pool: &PgPool,
    task_id: Uuid,
    exec_type: ExecutionType,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM executions WHERE task_id = $1 AND exec_type = $2",
    )
    .bind(task_id)
    .bind(exec_type)
    .fetch_one(pool)
    .await
    .context("failed to count executions by type")?;

    Ok(row.0)
}

/// Count `RUNNING` executions across a project's tasks (fairness cap input).
pub async fn count_running_for_project(pool: &PgPool, project_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM executions e \
         JOIN tasks t ON t.id = e.task_id \
         WHERE t.project_id = $1 AND e.status = 'RUNNING'",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await
    .context("failed to count running executions for project")?;

    Ok(row.0)
}

/// Transition an execution `PENDING -> RUNNING`, recording the child pid.
///
/// Sets `started_at`. Returns 0 rows when the execution was not `PENDING`
/// (lost race or already terminal).
pub async fn mark_running(pool: &PgPool, execution_id: Uuid, pid: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET status = 'RUNNING', pid = $1, started_at = NOW() \
         WHERE id = $2 AND status = 'PENDING'",
    )
    .bind(pid)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to mark execution running")?;

    Ok(result.rows_affected())
}

/// Update the progress fraction of a live execution.
pub async fn update_progress(pool: &PgPool, execution_id: Uuid, progress: f64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET progress = $1 \
         WHERE id = $2 AND status IN ('PENDING', 'RUNNING')",
    )
    .bind(progress.clamp(0.0, 1.0))
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to update execution progress")?;

    Ok(result.rows_affected())
}

/// Move an execution into a terminal status.
///
/// Guarded so terminal rows stay immutable: only `PENDING`/`RUNNING` rows
/// are updated. Clears the pid, sets `completed_at`, and records the error
/// string and result blob when given.
pub async fn finish_execution(
    pool: &PgPool,
    execution_id: Uuid,
    status: ExecutionStatus,
    progress: f64,
    error: Option<&str>,
    result_blob: Option<&serde_json::Value>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET status = $1, progress = $2, error = $3, result = $4, \
             pid = NULL, completed_at = NOW() \
         WHERE id = $5 AND status IN ('PENDING', 'RUNNING')",
    )
    .bind(status)
    .bind(progress.clamp(0.0, 1.0))
    .bind(error)
    .bind(result_blob)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to finish execution")?;

    Ok(result.rows_affected())
}
