//! Task state machine transitions.
//!
//! Validates and executes status transitions for tasks, enforcing the
//! allowed transition graph and optimistic locking on the expected prior
//! status. Status-triggered side effects live in [`crate::flow`]; this
//! module only moves the row.

pub mod dispatch;

use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::TaskStatus;
use autodev_db::queries::tasks as db;

use crate::error::{CoreError, CoreResult};

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// TODO           -> PLANNING | CANCELLED
/// PLANNING       -> PLAN_REVIEWING | CANCELLED
/// PLAN_REVIEWING -> IMPLEMENTING | PLANNING (re-plan) | CANCELLED
/// IMPLEMENTING   -> CODE_REVIEWING | CANCELLED
/// CODE_REVIEWING -> DONE | CANCELLED
/// DONE, CANCELLED   (terminal)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Todo, Planning)
                | (Todo, Cancelled)
                | (Planning, PlanReviewing)
                | (Planning, Cancelled)
                | (PlanReviewing, Implementing)
                | (PlanReviewing, Planning)
                | (PlanReviewing, Cancelled)
                | (Implementing, CodeReviewing)
                | (Implementing, Cancelled)
                | (CodeReviewing, Done)
                | (CodeReviewing, Cancelled)
        )
    }

    /// The statuses reachable from `from` in a single transition.
    pub fn successors(from: TaskStatus) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match from {
            Todo => &[Planning, Cancelled],
            Planning => &[PlanReviewing, Cancelled],
            PlanReviewing => &[Implementing, Planning, Cancelled],
            Implementing => &[CodeReviewing, Cancelled],
            CodeReviewing => &[Done, Cancelled],
            Done | Cancelled => &[],
        }
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Returns an error if:
    /// - the transition is not a valid edge ([`CoreError::InvalidTransition`]);
    /// - the task does not exist ([`CoreError::NotFound`]);
    /// - the current status no longer matches `from`
    ///   ([`CoreError::Conflict`], the race was lost).
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> CoreResult<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(CoreError::InvalidTransition { from, to });
        }

        let rows = db::transition_task_status(pool, task_id, from, to)
            .await
            .map_err(CoreError::external)?;

        if rows == 0 {
            // Either the task does not exist or the status did not match.
            let task = db::get_task(pool, task_id)
                .await
                .map_err(CoreError::external)?;
            return match task {
                None => Err(CoreError::NotFound {
                    kind: "task",
                    id: task_id,
                }),
                Some(t) => Err(CoreError::Conflict(format!(
                    "task {} has status {}, expected {}",
                    task_id, t.status, from
                ))),
            };
        }

        Ok(())
    }
}
