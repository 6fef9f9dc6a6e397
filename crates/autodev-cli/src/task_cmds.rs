//! `autodev task` subcommands: creation, inspection, and the lifecycle
//! transitions a human drives.

use anyhow::Result;
use clap::Subcommand;

use autodev_db::models::TaskStatus;
use autodev_db::queries::{
    executions as exec_db, plans as plan_db, pull_requests as pr_db, tasks as task_db,
};

use crate::context::AppContext;
use crate::project_cmds::parse_id;

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task in TODO
    Add {
        /// Owning project ID
        project_id: String,
        /// Task title
        title: String,
        /// Longer description handed to the CLI
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List tasks for a project
    List {
        /// Project ID
        project_id: String,
    },
    /// Show one task with its plan, executions, and PR
    Show {
        /// Task ID
        task_id: String,
    },
    /// Start planning (TODO -> PLANNING)
    Plan {
        /// Task ID
        task_id: String,
    },
    /// Approve the plan and start implementation
    /// (PLAN_REVIEWING -> IMPLEMENTING)
    Approve {
        /// Task ID
        task_id: String,
    },
    /// Reject the plan and re-plan (PLAN_REVIEWING -> PLANNING)
    Replan {
        /// Task ID
        task_id: String,
    },
    /// Mark a reviewed task done (CODE_REVIEWING -> DONE)
    Done {
        /// Task ID
        task_id: String,
    },
    /// Cancel a task from any non-terminal status
    Cancel {
        /// Task ID
        task_id: String,
    },
}

pub async fn run(ctx: &AppContext, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Add {
            project_id,
            title,
            description,
        } => {
            let project_id = parse_id(&project_id)?;
            let task = ctx.flow.create_task(project_id, &title, &description).await?;
            println!("created task {} ({})", task.title, task.id);
            Ok(())
        }
        TaskCommands::List { project_id } => {
            let project_id = parse_id(&project_id)?;
            let tasks = task_db::list_tasks_for_project(&ctx.pool, project_id).await?;
            if tasks.is_empty() {
                println!("no tasks");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "{}  {:14}  {}",
                    task.id,
                    task.status.to_string(),
                    task.title
                );
            }
            Ok(())
        }
        TaskCommands::Show { task_id } => {
            let task_id = parse_id(&task_id)?;
            let Some(task) = task_db::get_task(&ctx.pool, task_id).await? else {
                anyhow::bail!("task {task_id} not found");
            };

            println!("task     {}", task.id);
            println!("title    {}", task.title);
            println!("status   {}", task.status);
            if let Some(branch) = &task.branch_name {
                println!("branch   {branch}");
            }

            if let Some(plan) = plan_db::get_live_plan_for_task(&ctx.pool, task_id).await? {
                println!("plan     {} ({})", plan.id, plan.status);
                println!("---\n{}\n---", plan.content);
            }

            for execution in exec_db::list_executions_for_task(&ctx.pool, task_id).await? {
                println!(
                    "exec     {}  {:14}  {:10}  progress {:.0}%{}",
                    execution.id,
                    execution.exec_type.to_string(),
                    execution.status.to_string(),
                    execution.progress * 100.0,
                    execution
                        .error
                        .as_deref()
                        .map(|e| format!("  error: {e}"))
                        .unwrap_or_default()
                );
            }

            if let Some(pr) = pr_db::get_for_task(&ctx.pool, task_id).await? {
                println!("pr       {}#{}  {}", pr.repository, pr.number, pr.status);
            }
            Ok(())
        }
        TaskCommands::Plan { task_id } => {
            transition(ctx, &task_id, TaskStatus::Planning).await
        }
        TaskCommands::Approve { task_id } => {
            transition(ctx, &task_id, TaskStatus::Implementing).await
        }
        TaskCommands::Replan { task_id } => {
            transition(ctx, &task_id, TaskStatus::Planning).await
        }
        TaskCommands::Done { task_id } => transition(ctx, &task_id, TaskStatus::Done).await,
        TaskCommands::Cancel { task_id } => {
            transition(ctx, &task_id, TaskStatus::Cancelled).await
        }
    }
}

async fn transition(ctx: &AppContext, task_id: &str, to: TaskStatus) -> Result<()> {
    let task_id = parse_id(task_id)?;
    let task = ctx.flow.transition(task_id, to).await?;
    println!("task {} is now {}", task.id, task.status);
    Ok(())
}
