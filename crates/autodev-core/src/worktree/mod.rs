//! Git worktree management for task isolation.
//!
//! Each task runs its executions in an isolated git worktree on a
//! task-dedicated branch, so multiple tasks of the same project proceed
//! concurrently without mutating shared state. Worktrees hang off a local
//! mirror clone of the project repository and live under
//! `{base}/project-{project_id}/task-{task_id}`.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it uses a lock file on the shared object store), so all
//! mutating git operations for one project are serialised through a
//! per-project mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use rand::Rng;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use autodev_db::models::{Project, Task, Worktree, WorktreeStatus};
use autodev_db::queries::worktrees as db;

use crate::config::WorktreeConfig;
use crate::error::CoreError;

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// A git command failed to execute at all.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The computed worktree path exceeds the configured maximum length.
    #[error("worktree path too long: {len} > {max} ({path})")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The filesystem under the base directory is low on space.
    #[error("insufficient disk space: {available} bytes available, {required} required")]
    DiskSpace { available: u64, required: u64 },

    /// A unique path could not be found after collision retries.
    #[error("worktree path collision could not be resolved for {0}")]
    PathCollision(PathBuf),

    /// The task has no branch assigned yet.
    #[error("task {0} has no branch name")]
    MissingBranch(Uuid),

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),

    /// A database read/write around the git operation failed.
    #[error("worktree storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<WorktreeError> for CoreError {
    fn from(err: WorktreeError) -> Self {
        match err {
            WorktreeError::PathTooLong { .. } | WorktreeError::DiskSpace { .. } => {
                CoreError::ResourceExhausted(err.to_string())
            }
            WorktreeError::PathCollision(_) => CoreError::Conflict(err.to_string()),
            other => CoreError::external(other),
        }
    }
}

/// Information about a single git worktree as reported by git.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in this worktree, if any.
    pub branch: Option<String>,
    /// HEAD commit SHA.
    pub head_commit: String,
}

/// Manages git worktrees and their database records.
#[derive(Debug)]
pub struct WorktreeManager {
    config: WorktreeConfig,
    /// One mutex per project, serialising git operations against the same
    /// local repository.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        Self {
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory for one project's mirror and worktrees.
    pub fn project_dir(&self, project_id: Uuid) -> PathBuf {
        self.config.base_dir.join(format!("project-{project_id}"))
    }

    /// Path of the project's local mirror clone.
    pub fn repo_path(&self, project_id: Uuid) -> PathBuf {
        self.project_dir(project_id).join("repo")
    }

    fn project_lock(&self, project_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(project_id).or_default().clone()
    }

    /// Ensure an isolated worktree exists for the task, returning its
    /// database record in `ACTIVE` status.
    ///
    /// Idempotent: when the task already has an `ACTIVE` worktree whose
    /// directory still exists, it is returned as-is. Otherwise the
    /// project's local clone is created/updated, a branch is created off
    /// the project main branch, and the worktree is materialized at
    /// `{base}/project-{project_id}/task-{task_id}` (with a random suffix
    /// on path collision).
    pub async fn acquire(
        &self,
        pool: &PgPool,
        project: &Project,
        task: &Task,
    ) -> Result<Worktree, WorktreeError> {
        let branch = task
            .branch_name
            .clone()
            .ok_or(WorktreeError::MissingBranch(task.id))?;

        let lock = self.project_lock(project.id);
        let _guard = lock.lock().await;

        // Reuse an existing active worktree when its directory survived.
        if let Some(existing) = db::get_active_for_task(pool, task.id).await? {
            if Path::new(&existing.path).is_dir() {
                tracing::info!(
                    task_id = %task.id,
                    path = %existing.path,
                    "worktree already active, returning existing"
                );
                return Ok(existing);
            }
            tracing::warn!(
                task_id = %task.id,
                path = %existing.path,
                "active worktree directory missing, recreating"
            );
            db::update_status(pool, existing.id, WorktreeStatus::Error).await?;
        }

        self.check_free_space()?;

        let repo = self.ensure_mirror(project)?;

        // Find a free path, retrying with a short random suffix on
        // collision (a previous crashed run may have left the directory).
        let base_path = self.project_dir(project.id).join(format!("task-{}", task.id));
        let path = self.pick_free_path(&base_path)?;
        self.check_path_length(&path)?;

        let record = db::insert_worktree(
            pool,
            project.id,
            task.id,
            &branch,
            &path.to_string_lossy(),
        )
        .await?;

        if let Err(e) = self.add_worktree(&repo, &branch, &path, &project.main_branch) {
            self.cleanup_partial(&repo, &path);
            db::update_status(pool, record.id, WorktreeStatus::Error).await?;
            return Err(e);
        }

        db::update_status(pool, record.id, WorktreeStatus::Active).await?;

        tracing::info!(
            task_id = %task.id,
            branch = %branch,
            path = %path.display(),
            "worktree created"
        );

        db::get_worktree(pool, record.id)
            .await?
            .ok_or_else(|| WorktreeError::ParseError("worktree row vanished".into()))
    }

    /// Remove a task's worktree from disk and git, marking the record
    /// `COMPLETED` (or `ERROR` on failure).
    ///
    /// When `delete_branch` is set the task branch is force-deleted too
    /// (used for cancelled tasks whose work should not survive).
    pub async fn release(
        &self,
        pool: &PgPool,
        worktree: &Worktree,
        delete_branch: bool,
    ) -> Result<(), WorktreeError> {
        let lock = self.project_lock(worktree.project_id);
        let _guard = lock.lock().await;

        let repo = self.repo_path(worktree.project_id);
        let path = PathBuf::from(&worktree.path);

        let result = self.remove_worktree(&repo, &path).and_then(|()| {
            if delete_branch {
                self.delete_branch(&repo, &worktree.branch_name)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                db::update_status(pool, worktree.id, WorktreeStatus::Completed).await?;
                tracing::info!(
                    task_id = %worktree.task_id,
                    path = %worktree.path,
                    "worktree released"
                );
                Ok(())
            }
            Err(e) => {
                db::update_status(pool, worktree.id, WorktreeStatus::Error).await?;
                Err(e)
            }
        }
    }

    /// List all git worktrees registered against a project's mirror.
    pub fn list_worktrees(&self, project_id: Uuid) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let repo = self.repo_path(project_id);
        let output = run_git(&repo, &["worktree", "list", "--porcelain"])?;
        parse_porcelain_output(&output)
    }

    /// Prune stale worktree registrations whose directories disappeared.
    pub fn prune(&self, project_id: Uuid) -> Result<(), WorktreeError> {
        let repo = self.repo_path(project_id);
        run_git(&repo, &["worktree", "prune"]).map(|_| ())
    }

    // -- git plumbing -------------------------------------------------------

    /// Make sure the project's local clone exists and its main branch is
    /// current. Returns the clone path.
    fn ensure_mirror(&self, project: &Project) -> Result<PathBuf, WorktreeError> {
        let repo = self.repo_path(project.id);

        if !repo.join(".git").exists() {
            let parent = self.project_dir(project.id);
            std::fs::create_dir_all(&parent).map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to create {}", parent.display()),
                source: e,
            })?;

            run_git(
                &parent,
                &[
                    "clone",
                    "--branch",
                    &project.main_branch,
                    &project.repo_url,
                    "repo",
                ],
            )?;
            return Ok(repo);
        }

        // Refresh the main branch; a stale mirror just means older base
        // commits, so fetch failures are non-fatal for offline use.
        if let Err(e) = run_git(&repo, &["fetch", "origin", &project.main_branch]) {
            tracing::warn!(
                project_id = %project.id,
                error = %e,
                "fetch failed, using stale mirror"
            );
        }

        Ok(repo)
    }

    fn add_worktree(
        &self,
        repo: &Path,
        branch: &str,
        path: &Path,
        main_branch: &str,
    ) -> Result<(), WorktreeError> {
        let branch_exists = run_git(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")]).is_ok();

        let path_str = path.to_string_lossy();
        if branch_exists {
            // Stable branch per task: re-use it after a crash or re-plan.
            run_git(repo, &["worktree", "add", &path_str, branch])?;
        } else {
            run_git(
                repo,
                &["worktree", "add", "-b", branch, &path_str, main_branch],
            )?;
        }
        Ok(())
    }

    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), WorktreeError> {
        if !path.exists() {
            // Directory already gone; just prune the registration.
            let _ = run_git(repo, &["worktree", "prune"]);
            return Ok(());
        }

        match run_git(repo, &["worktree", "remove", "--force", &path.to_string_lossy()]) {
            Ok(_) => Ok(()),
            Err(WorktreeError::GitExit { stderr, .. })
                if stderr.contains("is not a working tree") =>
            {
                // Unregistered directory; remove it directly.
                let _ = std::fs::remove_dir_all(path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), WorktreeError> {
        match run_git(repo, &["branch", "-D", branch]) {
            Ok(_) => Ok(()),
            // Branch not found is not an error for idempotency.
            Err(WorktreeError::GitExit { stderr, .. }) if stderr.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort cleanup of a partially created worktree directory.
    fn cleanup_partial(&self, repo: &Path, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = run_git(repo, &["worktree", "prune"]);
    }

    // -- policies -----------------------------------------------------------

    fn pick_free_path(&self, base: &Path) -> Result<PathBuf, WorktreeError> {
        if !base.exists() {
            return Ok(base.to_path_buf());
        }
        for _ in 0..4 {
            let suffix: String = rand::rng()
                .sample_iter(rand::distr::Alphanumeric)
                .take(4)
                .map(|b| (b as char).to_ascii_lowercase())
                .collect();
            let candidate = base.with_file_name(format!(
                "{}-{suffix}",
                base.file_name().unwrap_or_default().to_string_lossy()
            ));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(WorktreeError::PathCollision(base.to_path_buf()))
    }

    fn check_path_length(&self, path: &Path) -> Result<(), WorktreeError> {
        let len = path.as_os_str().len();
        if len > self.config.max_path_length {
            return Err(WorktreeError::PathTooLong {
                path: path.to_path_buf(),
                len,
                max: self.config.max_path_length,
            });
        }
        Ok(())
    }

    #[cfg(unix)]
    fn check_free_space(&self) -> Result<(), WorktreeError> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        // Walk up to the closest existing ancestor of the base dir.
        let mut probe = self.config.base_dir.as_path();
        while !probe.exists() {
            match probe.parent() {
                Some(p) => probe = p,
                None => return Ok(()),
            }
        }

        let c_path = CString::new(probe.as_os_str().as_bytes())
            .map_err(|_| WorktreeError::ParseError("base dir contains NUL".into()))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is a valid NUL-terminated path, stat is zeroed.
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if ret != 0 {
            // Probe failure is not a space shortage.
            return Ok(());
        }

        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        if available < self.config.min_free_bytes {
            return Err(WorktreeError::DiskSpace {
                available,
                required: self.config.min_free_bytes,
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_free_space(&self) -> Result<(), WorktreeError> {
        Ok(())
    }
}

/// Run a git subcommand inside `dir`, returning stdout on success.
fn run_git(dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| WorktreeError::GitCommand {
            message: format!("failed to run git {}", args.join(" ")),
            source: e,
        })?;

    if !output.status.success() {
        return Err(WorktreeError::GitExit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parse the porcelain output of `git worktree list --porcelain`.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare` instead of `branch`, and detached
/// worktrees show `detached`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
        // Ignore `bare`, `detached`, `prunable`, etc.
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}
