//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::TaskStatus;

use super::TaskStateMachine;
use crate::error::CoreResult;

/// Start planning: transition `TODO -> PLANNING`.
pub async fn begin_planning(pool: &PgPool, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Todo, TaskStatus::Planning).await
}

/// Submit the produced plan for human review:
/// transition `PLANNING -> PLAN_REVIEWING`.
pub async fn submit_plan_for_review(pool: &PgPool, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Planning,
        TaskStatus::PlanReviewing,
    )
    .await
}

/// Approve the plan and start implementation:
/// transition `PLAN_REVIEWING -> IMPLEMENTING`.
pub async fn approve_plan(pool: &PgPool, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::PlanReviewing,
        TaskStatus::Implementing,
    )
    .await
}

/// Send the task back for a new plan:
/// transition `PLAN_REVIEWING -> PLANNING`.
pub async fn request_replan(pool: &PgPool, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::PlanReviewing,
        TaskStatus::Planning,
    )
    .await
}

/// Move a finished implementation into review:
/// transition `IMPLEMENTING -> CODE_REVIEWING`.
pub async fn begin_code_review(pool: &PgPool, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Implementing,
        TaskStatus::CodeReviewing,
    )
    .await
}

/// Close out a merged task: transition `CODE_REVIEWING -> DONE`.
pub async fn finish_task(pool: &PgPool, task_id: Uuid) -> CoreResult<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::CodeReviewing,
        TaskStatus::Done,
    )
    .await
}

/// Cancel a task from whatever non-terminal status it currently holds.
pub async fn cancel_task(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> CoreResult<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskStatus::Cancelled).await
}
