//! `autodev status`: the task board and queue counters.

use anyhow::Result;

use autodev_db::models::{JobStatus, TaskStatus};
use autodev_db::queries::{jobs as job_db, projects as project_db, tasks as task_db};

use crate::context::AppContext;

const TASK_STATUSES: [TaskStatus; 7] = [
    TaskStatus::Todo,
    TaskStatus::Planning,
    TaskStatus::PlanReviewing,
    TaskStatus::Implementing,
    TaskStatus::CodeReviewing,
    TaskStatus::Done,
    TaskStatus::Cancelled,
];

pub async fn run(ctx: &AppContext) -> Result<()> {
    let projects = project_db::list_projects(&ctx.pool).await?;
    if projects.is_empty() {
        println!("no projects registered");
        return Ok(());
    }

    for project in &projects {
        println!("{}  ({})", project.name, project.id);
        let tasks = task_db::list_tasks_for_project(&ctx.pool, project.id).await?;
        for status in TASK_STATUSES {
            let in_status: Vec<_> = tasks.iter().filter(|t| t.status == status).collect();
            if in_status.is_empty() {
                continue;
            }
            println!("  {status}");
            for task in in_status {
                println!("    {}  {}", task.id, task.title);
            }
        }
        println!();
    }

    let queued = job_db::count_by_status(&ctx.pool, JobStatus::Queued).await?;
    let running = job_db::count_by_status(&ctx.pool, JobStatus::Running).await?;
    let dead = job_db::count_by_status(&ctx.pool, JobStatus::Dead).await?;
    println!("jobs: {queued} queued, {running} running, {dead} dead");

    Ok(())
}
