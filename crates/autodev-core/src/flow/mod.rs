//! Task usecase: validated status transitions plus their status-triggered
//! side effects.
//!
//! The transition itself is the durable step; side effects (branch
//! assignment, job enqueue, plan bookkeeping, PR request, cleanup
//! scheduling, event publish) are idempotent and replay-safe, so a side
//! effect that fails after the status persisted is logged and repaired by
//! the scheduler rather than rolling the status back.

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use autodev_db::models::{
    ExecutionStatus, Plan, PlanStatus, Project, Task, TaskStatus,
};
use autodev_db::queries::{
    executions as exec_db, plans as plan_db, projects as project_db,
    pull_requests as pr_db, tasks as task_db, worktrees as wt_db,
};

use crate::branch;
use crate::broker::{self, Event, EventBroker, kinds};
use crate::error::{CoreError, CoreResult};
use crate::pr::{OpenPrRequest, PullRequester, repository_from_url};
use crate::queue::JobQueue;
use crate::state::TaskStateMachine;
use crate::supervisor::CancelRegistry;

/// Drives tasks through the lifecycle.
#[derive(Clone)]
pub struct TaskFlow {
    pool: PgPool,
    queue: JobQueue,
    events: EventBroker,
    pr: Arc<dyn PullRequester>,
    cancels: Arc<CancelRegistry>,
}

impl TaskFlow {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        events: EventBroker,
        pr: Arc<dyn PullRequester>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            pool,
            queue,
            events,
            pr,
            cancels,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    // -- project / task intake ---------------------------------------------

    /// Create a project after validating its git coordinates.
    pub async fn create_project(
        &self,
        name: &str,
        repo_url: &str,
        main_branch: &str,
        worktree_base: Option<&str>,
        cli_adapter: &str,
    ) -> CoreResult<Project> {
        if repo_url.trim().is_empty() {
            return Err(CoreError::Conflict("repo_url must not be empty".into()));
        }
        if main_branch.trim().is_empty() {
            return Err(CoreError::Conflict("main_branch must not be empty".into()));
        }

        let project = project_db::insert_project(
            &self.pool,
            name,
            repo_url,
            main_branch,
            worktree_base,
            cli_adapter,
        )
        .await
        .map_err(CoreError::external)?;

        self.events
            .publish(
                &broker::project_channel(project.id),
                &Event::new(kinds::PROJECT_UPDATED, json!({"id": project.id, "name": project.name})),
            )
            .await;

        Ok(project)
    }

    /// Delete a project; refused while tasks remain.
    pub async fn delete_project(&self, project_id: Uuid) -> CoreResult<()> {
        let tasks = project_db::count_tasks(&self.pool, project_id)
            .await
            .map_err(CoreError::external)?;
        if tasks > 0 {
            return Err(CoreError::Conflict(format!(
                "project {project_id} still has {tasks} tasks"
            )));
        }
        let rows = project_db::delete_project(&self.pool, project_id)
            .await
            .map_err(CoreError::external)?;
        if rows == 0 {
            return Err(CoreError::NotFound {
                kind: "project",
                id: project_id,
            });
        }
        Ok(())
    }

    /// Create a task in `TODO`.
    pub async fn create_task(
        &self,
        project_id: Uuid,
        title: &str,
        description: &str,
    ) -> CoreResult<Task> {
        let project = project_db::get_project(&self.pool, project_id)
            .await
            .map_err(CoreError::external)?
            .ok_or(CoreError::NotFound {
                kind: "project",
                id: project_id,
            })?;

        let task = task_db::insert_task(&self.pool, project.id, title, description)
            .await
            .map_err(CoreError::external)?;

        let event = Event::new(
            kinds::TASK_CREATED,
            json!({"id": task.id, "project_id": task.project_id, "title": task.title, "status": task.status}),
        );
        self.events
            .publish(&broker::task_channel(task.id), &event)
            .await;
        self.events
            .publish(&broker::project_channel(project.id), &event)
            .await;

        Ok(task)
    }

    // -- transitions --------------------------------------------------------

    /// Transition a task to `to`, validating the edge against the current
    /// status and firing that edge's side effects.
    pub async fn transition(&self, task_id: Uuid, to: TaskStatus) -> CoreResult<Task> {
        let task = task_db::get_task(&self.pool, task_id)
            .await
            .map_err(CoreError::external)?
            .ok_or(CoreError::NotFound {
                kind: "task",
                id: task_id,
            })?;
        let from = task.status;

        TaskStateMachine::transition(&self.pool, task_id, from, to).await?;

        info!(task_id = %task_id, %from, %to, "task transitioned");

        // The status is durable at this point. Side effects are idempotent
        // and must never roll it back; failures are logged and repaired by
        // the scheduler's sweeps.
        if let Err(e) = self.apply_side_effects(&task, to).await {
            warn!(
                task_id = %task_id,
                %to,
                error = %e,
                "side effect failed after transition (will be repaired)"
            );
        }

        let event = Event::new(
            kinds::TASK_STATUS_CHANGED,
            json!({"task_id": task_id, "from": from, "to": to}),
        );
        self.events
            .publish(&broker::task_channel(task_id), &event)
            .await;
        self.events
            .publish(&broker::project_channel(task.project_id), &event)
            .await;

        task_db::get_task(&self.pool, task_id)
            .await
            .map_err(CoreError::external)?
            .ok_or(CoreError::NotFound {
                kind: "task",
                id: task_id,
            })
    }

    async fn apply_side_effects(&self, task: &Task, to: TaskStatus) -> CoreResult<()> {
        match to {
            TaskStatus::Planning => {
                // Assign the stable branch name on first entry.
                let name = branch::branch_name_for_task(&task.title, task.id);
                task_db::assign_branch_name(&self.pool, task.id, &name)
                    .await
                    .map_err(CoreError::external)?;
                // Re-plan: the previous plan is no longer live.
                let rejected = plan_db::reject_live_plan(&self.pool, task.id)
                    .await
                    .map_err(CoreError::external)?;
                if rejected > 0 {
                    self.publish_plan_update(task.id).await;
                }
                self.queue.enqueue_planning(task.id).await?;
            }
            TaskStatus::PlanReviewing => {
                // Awaits the human; the status-change event is enough.
            }
            TaskStatus::Implementing => {
                self.approve_live_plan(task.id).await?;
                self.queue.enqueue_implementation(task.id).await?;
            }
            TaskStatus::CodeReviewing => {
                // Worktree stays active until the PR merges.
                self.ensure_pull_request(task).await?;
            }
            TaskStatus::Done => {
                wt_db::schedule_cleanup(&self.pool, task.id)
                    .await
                    .map_err(CoreError::external)?;
            }
            TaskStatus::Cancelled => {
                self.cancel_running_execution(task.id).await?;
                wt_db::schedule_cleanup(&self.pool, task.id)
                    .await
                    .map_err(CoreError::external)?;
            }
            TaskStatus::Todo => {}
        }
        Ok(())
    }

    /// Record a freshly produced plan and move the task into review.
    ///
    /// Called by the planning job handler once the execution completed and
    /// the plan markdown was extracted.
    pub async fn submit_plan(&self, task: &Task, content: &str) -> CoreResult<Plan> {
        // Replays may leave a live plan behind; only one non-rejected plan
        // may exist at a time.
        plan_db::reject_live_plan(&self.pool, task.id)
            .await
            .map_err(CoreError::external)?;

        let plan = plan_db::insert_plan(&self.pool, task.id, content, PlanStatus::Reviewing)
            .await
            .map_err(CoreError::external)?;

        self.events
            .publish(
                &broker::task_channel(task.id),
                &Event::new(
                    kinds::PLAN_CREATED,
                    json!({"id": plan.id, "task_id": task.id, "status": plan.status}),
                ),
            )
            .await;

        self.transition(task.id, TaskStatus::PlanReviewing).await?;
        Ok(plan)
    }

    async fn approve_live_plan(&self, task_id: Uuid) -> CoreResult<()> {
        let Some(plan) = plan_db::get_live_plan_for_task(&self.pool, task_id)
            .await
            .map_err(CoreError::external)?
        else {
            // Plan-less approval is refused upstream by the state machine
            // edge guard; tolerate it here for replays.
            warn!(task_id = %task_id, "no live plan to approve");
            return Ok(());
        };

        if plan.status == PlanStatus::Reviewing {
            plan_db::update_plan_status(&self.pool, plan.id, PlanStatus::Reviewing, PlanStatus::Approved)
                .await
                .map_err(CoreError::external)?;
            self.publish_plan_update(task_id).await;
        }
        Ok(())
    }

    async fn publish_plan_update(&self, task_id: Uuid) {
        self.events
            .publish(
                &broker::task_channel(task_id),
                &Event::new(kinds::PLAN_UPDATED, json!({"task_id": task_id})),
            )
            .await;
    }

    /// Cancel whatever execution is currently running for the task.
    ///
    /// In-process executions get their cancellation token triggered and
    /// shut down through the supervisor. An execution owned by a process
    /// that died is finalized directly; the guarded terminal update keeps
    /// this race-safe against a live supervisor.
    async fn cancel_running_execution(&self, task_id: Uuid) -> CoreResult<()> {
        let Some(execution) = exec_db::get_running_for_task(&self.pool, task_id)
            .await
            .map_err(CoreError::external)?
        else {
            return Ok(());
        };

        if self.cancels.cancel(execution.id) {
            info!(execution_id = %execution.id, "cancel signalled to supervisor");
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = execution.pid {
            // SAFETY: best-effort signal to a recorded child pid.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }

        let rows = exec_db::finish_execution(
            &self.pool,
            execution.id,
            ExecutionStatus::Cancelled,
            execution.progress,
            Some("cancelled with task"),
            None,
        )
        .await
        .map_err(CoreError::external)?;

        if rows > 0 {
            self.events
                .publish(
                    &broker::execution_channel(execution.id),
                    &Event::new(
                        kinds::EXECUTION_CANCELLED,
                        json!({"id": execution.id, "task_id": task_id}),
                    ),
                )
                .await;
        }

        Ok(())
    }

    /// Open the task's pull request if it does not exist yet.
    pub async fn ensure_pull_request(&self, task: &Task) -> CoreResult<()> {
        if pr_db::get_for_task(&self.pool, task.id)
            .await
            .map_err(CoreError::external)?
            .is_some()
        {
            return Ok(());
        }

        let project = project_db::get_project(&self.pool, task.project_id)
            .await
            .map_err(CoreError::external)?
            .ok_or(CoreError::NotFound {
                kind: "project",
                id: task.project_id,
            })?;

        let Some(branch) = task.branch_name.clone() else {
            return Err(CoreError::Conflict(format!(
                "task {} reached code review without a branch",
                task.id
            )));
        };

        let repository =
            repository_from_url(&project.repo_url).unwrap_or_else(|| project.repo_url.clone());

        let request = OpenPrRequest {
            repository: repository.clone(),
            branch,
            base: project.main_branch.clone(),
            title: task.title.clone(),
            body: task.description.clone(),
        };

        let info = self.pr.open(&request).await?;

        pr_db::insert_pull_request(
            &self.pool,
            task.id,
            &repository,
            info.number,
            &request.title,
            &request.body,
        )
        .await
        .map_err(CoreError::external)?;

        self.events
            .publish(
                &broker::task_channel(task.id),
                &Event::new(
                    kinds::PULL_REQUEST_UPDATED,
                    json!({"task_id": task.id, "repository": repository, "number": info.number, "status": "OPEN"}),
                ),
            )
            .await;

        info!(task_id = %task.id, number = info.number, "pull request opened");
        Ok(())
    }
}
