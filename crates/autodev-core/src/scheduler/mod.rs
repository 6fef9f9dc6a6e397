//! Periodic maintenance sweeps.
//!
//! Every interval the scheduler:
//! 1. removes worktrees whose owning tasks are terminal past the grace
//!    period (or were explicitly flagged for cleanup);
//! 2. marks `RUNNING` executions whose process died as `FAILED`
//!    (crash recovery);
//! 3. polls `OPEN` pull requests for remote merges, driving
//!    `CODE_REVIEWING -> DONE`;
//! 4. re-opens missing PRs and re-enqueues lost jobs (side-effect repair);
//! 5. releases jobs stuck in `RUNNING` by a dead worker.

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autodev_db::models::{
    ExecutionStatus, ExecutionType, JobType, PrStatus, TaskStatus,
};
use autodev_db::queries::{
    executions as exec_db, jobs as job_db, pull_requests as pr_db, tasks as task_db,
    worktrees as wt_db,
};

use crate::broker::{self, Event, EventBroker, kinds};
use crate::config::WorktreeConfig;
use crate::flow::TaskFlow;
use crate::pr::{PullRequester, RemotePrState};
use crate::supervisor::CancelRegistry;
use crate::worktree::WorktreeManager;

/// Stuck `RUNNING` jobs are released after this many seconds.
const STUCK_JOB_AGE_SECS: i64 = 2 * 60 * 60;

pub struct Scheduler {
    pool: PgPool,
    events: EventBroker,
    worktrees: Arc<WorktreeManager>,
    pr: Arc<dyn PullRequester>,
    flow: TaskFlow,
    cancels: Arc<CancelRegistry>,
    config: WorktreeConfig,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        events: EventBroker,
        worktrees: Arc<WorktreeManager>,
        pr: Arc<dyn PullRequester>,
        flow: TaskFlow,
        cancels: Arc<CancelRegistry>,
        config: WorktreeConfig,
    ) -> Self {
        Self {
            pool,
            events,
            worktrees,
            pr,
            flow,
            cancels,
            config,
        }
    }

    /// Run sweeps on the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.cleanup_interval.as_secs(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One full maintenance pass. Each sweep is independent; a failing
    /// sweep logs and leaves the rest to run.
    pub async fn sweep(&self) {
        if let Err(e) = self.sweep_worktrees().await {
            warn!(error = %e, "worktree sweep failed");
        }
        if let Err(e) = self.sweep_crashed_executions().await {
            warn!(error = %e, "crash recovery sweep failed");
        }
        if let Err(e) = self.sweep_pull_requests().await {
            warn!(error = %e, "pull request sweep failed");
        }
        if let Err(e) = self.sweep_lost_side_effects().await {
            warn!(error = %e, "side-effect repair sweep failed");
        }
        match job_db::reset_stuck_jobs(&self.pool, STUCK_JOB_AGE_SECS).await {
            Ok(0) => {}
            Ok(n) => info!(jobs = n, "released stuck jobs"),
            Err(e) => warn!(error = %e, "stuck job sweep failed"),
        }
    }

    async fn sweep_worktrees(&self) -> anyhow::Result<()> {
        let grace = self.config.cleanup_grace.as_secs() as i64;
        let candidates = wt_db::list_cleanup_candidates(&self.pool, grace).await?;

        for worktree in candidates {
            let task = task_db::get_task(&self.pool, worktree.task_id).await?;
            // Cancelled tasks take their unmerged branches with them.
            let delete_branch =
                task.map(|t| t.status == TaskStatus::Cancelled).unwrap_or(true);

            match self.worktrees.release(&self.pool, &worktree, delete_branch).await {
                Ok(()) => {
                    info!(task_id = %worktree.task_id, path = %worktree.path, "worktree cleaned up");
                }
                Err(e) => {
                    warn!(
                        task_id = %worktree.task_id,
                        path = %worktree.path,
                        error = %e,
                        "worktree cleanup failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn sweep_crashed_executions(&self) -> anyhow::Result<()> {
        let running = exec_db::list_running(&self.pool).await?;

        for execution in running {
            // Executions supervised by this process are alive by definition.
            if self.cancels.is_supervised(execution.id) {
                continue;
            }
            if execution.pid.map(pid_alive).unwrap_or(false) {
                continue;
            }

            let rows = exec_db::finish_execution(
                &self.pool,
                execution.id,
                ExecutionStatus::Failed,
                execution.progress,
                Some("supervisor process is no longer alive"),
                None,
            )
            .await?;

            if rows > 0 {
                warn!(
                    execution_id = %execution.id,
                    task_id = %execution.task_id,
                    pid = execution.pid,
                    "recovered crashed execution"
                );
                self.events
                    .publish(
                        &broker::execution_channel(execution.id),
                        &Event::new(
                            kinds::EXECUTION_FAILED,
                            json!({
                                "id": execution.id,
                                "task_id": execution.task_id,
                                "error": "supervisor process is no longer alive",
                            }),
                        ),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn sweep_pull_requests(&self) -> anyhow::Result<()> {
        let open = pr_db::list_open(&self.pool).await?;

        for pr in open {
            let state = match self.pr.status(&pr.repository, pr.number).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(number = pr.number, error = %e, "PR poll failed");
                    continue;
                }
            };

            let new_status = match state {
                RemotePrState::Open => continue,
                RemotePrState::Merged => PrStatus::Merged,
                RemotePrState::Closed => PrStatus::Closed,
            };

            pr_db::update_status(&self.pool, pr.id, new_status).await?;
            self.events
                .publish(
                    &broker::task_channel(pr.task_id),
                    &Event::new(
                        kinds::PULL_REQUEST_UPDATED,
                        json!({"task_id": pr.task_id, "number": pr.number, "status": new_status}),
                    ),
                )
                .await;

            if new_status == PrStatus::Merged {
                // The task may already have moved (or been cancelled);
                // lost races are fine here.
                match self.flow.transition(pr.task_id, TaskStatus::Done).await {
                    Ok(_) => info!(task_id = %pr.task_id, number = pr.number, "PR merged, task done"),
                    Err(e) => warn!(task_id = %pr.task_id, error = %e, "could not finish merged task"),
                }
            }
        }
        Ok(())
    }

    /// Repair side effects that failed after their transition persisted:
    /// PRs that were never opened and jobs whose enqueue was lost.
    async fn sweep_lost_side_effects(&self) -> anyhow::Result<()> {
        for task in task_db::list_tasks_by_status(&self.pool, TaskStatus::CodeReviewing).await? {
            if pr_db::get_for_task(&self.pool, task.id).await?.is_none() {
                if let Err(e) = self.flow.ensure_pull_request(&task).await {
                    warn!(task_id = %task.id, error = %e, "PR repair failed");
                }
            }
        }

        self.repair_lost_jobs(TaskStatus::Planning, JobType::TaskPlanning, ExecutionType::Planning)
            .await?;
        self.repair_lost_jobs(
            TaskStatus::Implementing,
            JobType::TaskImplementation,
            ExecutionType::Implementation,
        )
        .await?;

        Ok(())
    }

    async fn repair_lost_jobs(
        &self,
        status: TaskStatus,
        job_type: JobType,
        exec_type: ExecutionType,
    ) -> anyhow::Result<()> {
        for task in task_db::list_tasks_by_status(&self.pool, status).await? {
            if job_db::has_live_job_for_task(&self.pool, task.id, job_type).await? {
                continue;
            }
            // An execution of this type already ran: the job completed and
            // the human decides what happens next, so nothing is lost.
            if exec_db::count_for_task_by_type(&self.pool, task.id, exec_type).await? > 0 {
                continue;
            }

            warn!(task_id = %task.id, %status, "re-enqueueing lost job");
            let result = match job_type {
                JobType::TaskPlanning => self.flow_queue().enqueue_planning(task.id).await,
                JobType::TaskImplementation => {
                    self.flow_queue().enqueue_implementation(task.id).await
                }
            };
            if let Err(e) = result {
                warn!(task_id = %task.id, error = %e, "re-enqueue failed");
            }
        }
        Ok(())
    }

    fn flow_queue(&self) -> &crate::queue::JobQueue {
        self.flow.queue()
    }
}

/// Whether a pid refers to a live process.
#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 probes for existence without sending anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive() {
        let pid = std::process::id() as i32;
        assert!(super::pid_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn nonsense_pid_is_dead() {
        assert!(!super::pid_alive(-1));
        assert!(!super::pid_alive(0));
    }
}
