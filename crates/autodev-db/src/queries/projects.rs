//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Project;

/// Insert a new project row. Returns the inserted project with
/// server-generated defaults (id, created_at).
pub async fn insert_project(
    pool: &PgPool,
    name: &str,
    repo_url: &str,
    main_branch: &str,
    worktree_base: Option<&str>,
    cli_adapter: &str,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (name, repo_url, main_branch, worktree_base, cli_adapter) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(name)
    .bind(repo_url)
    .bind(main_branch)
    .bind(worktree_base)
    .bind(cli_adapter)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects, ordered by creation time.
pub async fn list_projects(pool: &PgPool) -> Result<Vec<Project>> {
    let projects =
        sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at ASC")
            .fetch_all(pool)
            .await
            .context("failed to list projects")?;

    Ok(projects)
}

/// Count the tasks belonging to a project.
pub async fn count_tasks(pool: &PgPool, project_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE project_id = $1")
        .bind(project_id)
        .fetch_one(pool)
        .await
        .context("failed to count project tasks")?;

    Ok(row.0)
}

/// Delete a project. Fails (FK restriction) while any task remains.
pub async fn delete_project(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM projects WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete project")?;

    Ok(result.rows_affected())
}
