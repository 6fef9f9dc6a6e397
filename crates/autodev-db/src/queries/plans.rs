//! Database query functions for the `plans` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Plan, PlanStatus};

/// Insert a new plan row for a task.
///
/// The partial unique index on `plans` rejects this while the task still
/// has a non-rejected plan; callers reject the old plan first on re-plan.
pub async fn insert_plan(
    pool: &PgPool,
    task_id: Uuid,
    content: &str,
    status: PlanStatus,
) -> Result<Plan> {
    let plan = sqlx::query_as::<_, Plan>(
        "INSERT INTO plans (task_id, content, status) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(content)
    .bind(status)
    .fetch_one(pool)
    .await
    .context("failed to insert plan")?;

    Ok(plan)
}

/// Fetch a single plan by ID.
pub async fn get_plan(pool: &PgPool, id: Uuid) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan")?;

    Ok(plan)
}

/// Fetch the task's live (non-rejected) plan, if any.
pub async fn get_live_plan_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE task_id = $1 AND status <> 'REJECTED'",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch live plan")?;

    Ok(plan)
}

/// List every plan recorded for a task, newest last.
pub async fn list_plans_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Plan>> {
    let plans = sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list plans for task")?;

    Ok(plans)
}

/// Move a plan between statuses with an optimistic lock on the prior one.
pub async fn update_plan_status(
    pool: &PgPool,
    plan_id: Uuid,
    from: PlanStatus,
    to: PlanStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plans \
         SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(plan_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to update plan status")?;

    Ok(result.rows_affected())
}

/// Reject whatever live plan the task currently carries.
///
/// Idempotent: affects zero rows when no non-rejected plan exists. Used on
/// re-plan (`PLAN_REVIEWING -> PLANNING`) before a new planning run starts.
pub async fn reject_live_plan(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plans \
         SET status = 'REJECTED', updated_at = NOW() \
         WHERE task_id = $1 AND status <> 'REJECTED'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to reject live plan")?;

    Ok(result.rows_affected())
}
