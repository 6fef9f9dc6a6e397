//! Job handlers for the two job types.
//!
//! Delivery is at-least-once, so every handler starts by re-reading the
//! task and aborting quietly when the work already happened: the task
//! advanced past the target status, or an execution is already running.

use std::path::Path;
use std::process::Command;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autodev_db::models::{
    ExecutionStatus, ExecutionType, Job, PlanStatus, Project, Task, TaskStatus,
};
use autodev_db::queries::{
    execution_logs, executions as exec_db, plans as plan_db, projects as project_db,
    tasks as task_db,
};

use super::worker::WorkerContext;
use crate::adapter::CliAdapter;
use crate::error::{CoreError, CoreResult};
use crate::supervisor::RunRequest;

/// Handle a `TASK_PLANNING` job: run the planning CLI in the task's
/// worktree and turn its output into a plan awaiting review.
pub async fn run_planning(
    ctx: &WorkerContext,
    job: &Job,
    cancel: &CancellationToken,
) -> CoreResult<()> {
    let Some((task, project)) = load_if_current(ctx, job, TaskStatus::Planning).await? else {
        return Ok(());
    };

    check_project_capacity(ctx, &project).await?;

    let worktree = ctx.worktrees.acquire(&ctx.pool, &project, &task).await?;
    let adapter = CliAdapter::from_name(&project.cli_adapter, &ctx.settings)?;

    let execution = ctx
        .supervisor
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Planning,
                adapter: &adapter,
                worktree_path: Path::new(&worktree.path),
                plan: None,
            },
            cancel,
        )
        .await?;

    match execution.status {
        ExecutionStatus::Completed => {
            let logs = execution_logs::list_logs_for_execution(&ctx.pool, execution.id)
                .await
                .map_err(CoreError::external)?;
            let content = adapter.parse_output_to_plan(&logs)?;
            ctx.flow.submit_plan(&task, &content).await?;
            info!(task_id = %task.id, execution_id = %execution.id, "plan submitted for review");
        }
        status => {
            // The execution row carries the error; the task stays in
            // PLANNING for the human to re-transition or cancel.
            info!(
                task_id = %task.id,
                execution_id = %execution.id,
                %status,
                "planning execution did not complete"
            );
        }
    }

    Ok(())
}

/// Handle a `TASK_IMPLEMENTATION` job: run the implementation CLI against
/// the approved plan, commit and push the work, and move the task into
/// code review (which opens the PR).
pub async fn run_implementation(
    ctx: &WorkerContext,
    job: &Job,
    cancel: &CancellationToken,
) -> CoreResult<()> {
    let Some((task, project)) = load_if_current(ctx, job, TaskStatus::Implementing).await? else {
        return Ok(());
    };

    let plan = plan_db::get_live_plan_for_task(&ctx.pool, task.id)
        .await
        .map_err(CoreError::external)?
        .filter(|p| p.status == PlanStatus::Approved)
        .ok_or_else(|| {
            CoreError::Cli(format!("task {} has no approved plan", task.id))
        })?;

    check_project_capacity(ctx, &project).await?;

    let worktree = ctx.worktrees.acquire(&ctx.pool, &project, &task).await?;
    let adapter = CliAdapter::from_name(&project.cli_adapter, &ctx.settings)?;

    let execution = ctx
        .supervisor
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Implementation,
                adapter: &adapter,
                worktree_path: Path::new(&worktree.path),
                plan: Some(&plan),
            },
            cancel,
        )
        .await?;

    match execution.status {
        ExecutionStatus::Completed => {
            // Publish the branch so the PR has something to point at.
            // Failures here are non-fatal: the PR can still be opened once
            // the operator pushes by hand.
            if let Err(e) = commit_and_push(Path::new(&worktree.path), &task) {
                warn!(task_id = %task.id, error = %e, "failed to commit/push agent work (non-fatal)");
            }
            ctx.flow
                .transition(task.id, TaskStatus::CodeReviewing)
                .await?;
            info!(task_id = %task.id, execution_id = %execution.id, "implementation complete, task in code review");
        }
        status => {
            info!(
                task_id = %task.id,
                execution_id = %execution.id,
                %status,
                "implementation execution did not complete"
            );
        }
    }

    Ok(())
}

/// Idempotency gate: load the task and its project, or report why the job
/// should be dropped.
///
/// Returns `Ok(None)` when the work is already done or in flight.
async fn load_if_current(
    ctx: &WorkerContext,
    job: &Job,
    expected: TaskStatus,
) -> CoreResult<Option<(Task, Project)>> {
    let task = task_db::get_task(&ctx.pool, job.task_id)
        .await
        .map_err(CoreError::external)?
        .ok_or(CoreError::NotFound {
            kind: "task",
            id: job.task_id,
        })?;

    if task.status != expected {
        info!(
            task_id = %task.id,
            status = %task.status,
            expected = %expected,
            "task moved on, dropping job"
        );
        return Ok(None);
    }

    if exec_db::get_running_for_task(&ctx.pool, task.id)
        .await
        .map_err(CoreError::external)?
        .is_some()
    {
        info!(task_id = %task.id, "task already has a running execution, dropping job");
        return Ok(None);
    }

    let project = project_db::get_project(&ctx.pool, task.project_id)
        .await
        .map_err(CoreError::external)?
        .ok_or(CoreError::NotFound {
            kind: "project",
            id: task.project_id,
        })?;

    Ok(Some((task, project)))
}

/// Per-project fairness cap: refuse with backpressure when the project is
/// already running its full share of executions.
async fn check_project_capacity(ctx: &WorkerContext, project: &Project) -> CoreResult<()> {
    let Some(cap) = ctx.queue_config.per_project_limit else {
        return Ok(());
    };
    let running = exec_db::count_running_for_project(&ctx.pool, project.id)
        .await
        .map_err(CoreError::external)?;
    if running as usize >= cap {
        return Err(CoreError::ResourceExhausted(format!(
            "project {} already has {running} running executions (cap {cap})",
            project.id
        )));
    }
    Ok(())
}

/// Commit everything the CLI wrote and push the task branch.
fn commit_and_push(worktree_path: &Path, task: &Task) -> anyhow::Result<()> {
    let run = |args: &[&str]| -> anyhow::Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(worktree_path)
            .output()
            .with_context(|| format!("failed to run git {}", args.join(" ")))
    };

    // The worktree may not inherit an identity.
    let _ = run(&["config", "user.email", "autodev@localhost"]);
    let _ = run(&["config", "user.name", "autodev"]);

    let output = run(&["add", "-A"])?;
    if !output.status.success() {
        anyhow::bail!(
            "git add -A failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let status = run(&["status", "--porcelain"])?;
    if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
        info!(task_id = %task.id, "no changes to commit");
    } else {
        let message = format!("autodev: {}", task.title);
        let output = run(&["commit", "-m", &message])?;
        if !output.status.success() {
            anyhow::bail!(
                "git commit failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    let branch = task
        .branch_name
        .as_deref()
        .context("task has no branch to push")?;
    let output = run(&["push", "-u", "origin", branch])?;
    if !output.status.success() {
        anyhow::bail!(
            "git push failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(())
}
