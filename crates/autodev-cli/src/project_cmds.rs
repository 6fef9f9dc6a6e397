//! `autodev project` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use autodev_db::queries::projects as project_db;

use crate::context::AppContext;

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Register a project
    Add {
        /// Human-readable project name
        name: String,
        /// Git remote URL (https or ssh)
        repo_url: String,
        /// Branch worktrees branch off from
        #[arg(long, default_value = "main")]
        main_branch: String,
        /// CLI adapter for this project's executions
        #[arg(long, default_value = "claude-code")]
        adapter: String,
        /// Per-project worktree base directory override
        #[arg(long)]
        worktree_base: Option<String>,
    },
    /// List registered projects
    List,
    /// Delete a project (refused while tasks remain)
    Remove {
        /// Project ID
        project_id: String,
    },
}

pub async fn run(ctx: &AppContext, command: ProjectCommands) -> Result<()> {
    match command {
        ProjectCommands::Add {
            name,
            repo_url,
            main_branch,
            adapter,
            worktree_base,
        } => {
            let project = ctx
                .flow
                .create_project(
                    &name,
                    &repo_url,
                    &main_branch,
                    worktree_base.as_deref(),
                    &adapter,
                )
                .await?;
            println!("created project {} ({})", project.name, project.id);
            Ok(())
        }
        ProjectCommands::List => {
            let projects = project_db::list_projects(&ctx.pool).await?;
            if projects.is_empty() {
                println!("no projects");
                return Ok(());
            }
            for project in projects {
                println!(
                    "{}  {:24}  {}  [{}]",
                    project.id, project.name, project.repo_url, project.cli_adapter
                );
            }
            Ok(())
        }
        ProjectCommands::Remove { project_id } => {
            let id = parse_id(&project_id)?;
            ctx.flow.delete_project(id).await?;
            println!("deleted project {id}");
            Ok(())
        }
    }
}

pub fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid id: {s:?}"))
}
