//! Orchestrator configuration, read environment-first.
//!
//! Components take their config section as a constructor parameter;
//! composition happens once at start-up. No global container.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use autodev_db::config::DbConfig;

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Worktree placement and safety limits.
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Root directory under which all worktrees are materialized.
    pub base_dir: PathBuf,
    /// Paths longer than this are rejected before creation.
    pub max_path_length: usize,
    /// Minimum free bytes required on the base directory's filesystem.
    pub min_free_bytes: u64,
    /// Scheduler sweep period.
    pub cleanup_interval: Duration,
    /// How long a terminal task keeps its worktree before the sweep
    /// removes it.
    pub cleanup_grace: Duration,
}

impl WorktreeConfig {
    pub fn from_env() -> Self {
        let base_dir = env::var("WORKTREE_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("autodev")
                    .join("worktrees")
            });

        Self {
            base_dir,
            max_path_length: env_usize("WORKTREE_MAX_PATH_LENGTH").unwrap_or(255),
            min_free_bytes: env_u64("WORKTREE_MIN_DISK_SPACE").unwrap_or(1024 * 1024 * 1024),
            cleanup_interval: Duration::from_secs(
                env_u64("WORKTREE_CLEANUP_INTERVAL").unwrap_or(900),
            ),
            cleanup_grace: Duration::from_secs(
                env_u64("WORKTREE_CLEANUP_GRACE").unwrap_or(3600),
            ),
        }
    }
}

/// Worker pool and retry envelope settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Attempt cap before a job moves to the dead-letter bucket.
    pub max_attempts: i32,
    /// Optional cap on concurrent executions per project.
    pub per_project_limit: Option<usize>,
    /// Poll fallback interval when no NOTIFY arrives.
    pub poll_interval: Duration,
    /// How long a graceful shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            workers: env_usize("AUTODEV_WORKERS").unwrap_or(4),
            max_attempts: env_usize("AUTODEV_JOB_MAX_ATTEMPTS").unwrap_or(3) as i32,
            per_project_limit: env_usize("AUTODEV_PROJECT_CONCURRENCY"),
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(
                env_u64("AUTODEV_SHUTDOWN_GRACE").unwrap_or(30),
            ),
        }
    }
}

/// Execution supervisor timing and batching knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wall-time limit for planning executions.
    pub planning_timeout: Duration,
    /// Wall-time limit for implementation executions.
    pub implementation_timeout: Duration,
    /// Flush the log batch once it holds this many entries.
    pub batch_max: usize,
    /// Flush the log batch at least this often.
    pub flush_interval: Duration,
    /// Hard ceiling on buffered log entries; readers block above it.
    pub buffer_ceiling: usize,
    /// Grace window between SIGTERM and SIGKILL.
    pub term_grace: Duration,
    /// Minimum spacing between progress events.
    pub progress_interval: Duration,
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self {
            planning_timeout: Duration::from_secs(
                env_u64("AUTODEV_PLANNING_TIMEOUT").unwrap_or(300),
            ),
            implementation_timeout: Duration::from_secs(
                env_u64("AUTODEV_IMPLEMENTATION_TIMEOUT").unwrap_or(1800),
            ),
            batch_max: env_usize("AUTODEV_LOG_BATCH_MAX").unwrap_or(1000),
            flush_interval: Duration::from_secs(5),
            buffer_ceiling: env_usize("AUTODEV_LOG_BUFFER_CEILING").unwrap_or(10_000),
            term_grace: Duration::from_secs(10),
            progress_interval: Duration::from_millis(500),
        }
    }

    /// Timeout for the given execution type.
    pub fn timeout_for(&self, exec_type: autodev_db::models::ExecutionType) -> Duration {
        match exec_type {
            autodev_db::models::ExecutionType::Planning => self.planning_timeout,
            autodev_db::models::ExecutionType::Implementation => self.implementation_timeout,
        }
    }
}

/// Credentials and endpoints for the PR collaborator.
#[derive(Debug, Clone, Default)]
pub struct GithubConfig {
    pub token: Option<String>,
    /// GitHub Enterprise host, when not github.com.
    pub base_url: Option<String>,
}

impl GithubConfig {
    pub fn from_env() -> Self {
        Self {
            token: env::var("GITHUB_TOKEN").ok(),
            base_url: env::var("GITHUB_BASE_URL").ok(),
        }
    }
}

/// Adapter construction settings.
#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    /// Command run by the `fake` adapter (test seam).
    pub fake_command: Option<PathBuf>,
    /// Timeout override for the `fake` adapter.
    pub fake_timeout: Option<Duration>,
}

impl AdapterSettings {
    pub fn from_env() -> Self {
        Self {
            fake_command: env::var("AUTODEV_FAKE_CLI").ok().map(PathBuf::from),
            fake_timeout: env_u64("AUTODEV_FAKE_TIMEOUT").map(Duration::from_secs),
        }
    }
}

/// Top-level configuration, one section per component.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub db: DbConfig,
    pub worktree: WorktreeConfig,
    pub queue: QueueConfig,
    pub supervisor: SupervisorConfig,
    pub github: GithubConfig,
    pub adapters: AdapterSettings,
    /// Embedded in PR descriptions for back-links.
    pub app_base_url: Option<String>,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            db: DbConfig::from_env(),
            worktree: WorktreeConfig::from_env(),
            queue: QueueConfig::from_env(),
            supervisor: SupervisorConfig::from_env(),
            github: GithubConfig::from_env(),
            adapters: AdapterSettings::from_env(),
            app_base_url: env::var("APP_BASE_URL").ok(),
        }
    }
}
