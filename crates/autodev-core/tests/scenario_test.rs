//! End-to-end pipeline scenarios with the fake adapter, a fake PR
//! provider, and real temp git repositories.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use autodev_core::broker::EventBroker;
use autodev_core::config::{AdapterSettings, QueueConfig, SupervisorConfig, WorktreeConfig};
use autodev_core::error::CoreResult;
use autodev_core::flow::TaskFlow;
use autodev_core::pr::{OpenPrRequest, PrInfo, PullRequester, RemotePrState};
use autodev_core::queue::worker::WorkerContext;
use autodev_core::queue::{JobQueue, handlers};
use autodev_core::scheduler::Scheduler;
use autodev_core::supervisor::{CancelRegistry, ExecutionSupervisor};
use autodev_core::worktree::WorktreeManager;
use autodev_db::models::{
    ExecutionStatus, PlanStatus, PrStatus, Project, Task, TaskStatus, WorktreeStatus,
};
use autodev_db::queries::{
    execution_logs, executions as exec_db, plans as plan_db, pull_requests as pr_db,
    tasks as task_db, worktrees as wt_db,
};
use autodev_test_utils::{create_test_db, drop_test_db};

/// PR provider that hands out sequential numbers without touching GitHub.
#[derive(Default)]
struct StaticPullRequester {
    next_number: AtomicI64,
}

#[async_trait]
impl PullRequester for StaticPullRequester {
    async fn open(&self, req: &OpenPrRequest) -> CoreResult<PrInfo> {
        let number = 100 + self.next_number.fetch_add(1, Ordering::SeqCst);
        Ok(PrInfo {
            number,
            url: format!("https://github.com/{}/pull/{number}", req.repository),
        })
    }

    async fn status(&self, _repository: &str, _number: i64) -> CoreResult<RemotePrState> {
        Ok(RemotePrState::Open)
    }
}

struct Harness {
    pool: sqlx::PgPool,
    db_name: String,
    ctx: Arc<WorkerContext>,
    flow: TaskFlow,
    worktrees: Arc<WorktreeManager>,
    pr: Arc<StaticPullRequester>,
    cancels: Arc<CancelRegistry>,
    worktree_config: WorktreeConfig,
    _base: TempDir,
    _origin: TempDir,
    origin_path: PathBuf,
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn create_origin() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("origin");
    std::fs::create_dir_all(&path).unwrap();
    run_git(&path, &["init", "--initial-branch", "main"]);
    run_git(&path, &["config", "user.email", "test@autodev.dev"]);
    run_git(&path, &["config", "user.name", "Autodev Test"]);
    std::fs::write(path.join("README.md"), "# x\n").unwrap();
    run_git(&path, &["add", "."]);
    run_git(&path, &["commit", "-m", "Initial commit"]);
    // Allow pushes of side branches from worktree clones.
    run_git(&path, &["config", "receive.denyCurrentBranch", "refuse"]);
    (dir, path)
}

/// A fake CLI serving both phases: planning emits an ExitPlanMode frame,
/// implementation writes a file into the worktree.
const FAKE_CLI: &str = "#!/bin/sh\n\
if [ \"$AUTODEV_EXEC_TYPE\" = \"PLANNING\" ]; then\n\
  echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"id\":\"toolu_01\",\"name\":\"ExitPlanMode\",\"input\":{\"plan\":\"# Plan\\n- step\"}}]}}'\n\
  echo '{\"type\":\"result\",\"subtype\":\"success\"}'\n\
else\n\
  echo implemented > implemented.txt\n\
  echo '{\"type\":\"result\",\"subtype\":\"success\"}'\n\
fi\n";

async fn build_harness() -> Harness {
    let (pool, db_name) = create_test_db().await;
    let (_origin, origin_path) = create_origin();
    let base = TempDir::new().unwrap();

    let script = base.path().join("fake_cli.sh");
    std::fs::write(&script, FAKE_CLI).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let worktree_config = WorktreeConfig {
        base_dir: base.path().join("worktrees"),
        max_path_length: 4096,
        min_free_bytes: 0,
        cleanup_interval: Duration::from_secs(900),
        cleanup_grace: Duration::from_secs(0),
    };
    let queue_config = QueueConfig {
        workers: 1,
        max_attempts: 3,
        per_project_limit: None,
        poll_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_secs(5),
    };
    let supervisor_config = SupervisorConfig {
        planning_timeout: Duration::from_secs(30),
        implementation_timeout: Duration::from_secs(30),
        batch_max: 1000,
        flush_interval: Duration::from_millis(100),
        buffer_ceiling: 10_000,
        term_grace: Duration::from_secs(1),
        progress_interval: Duration::from_millis(500),
    };
    let settings = AdapterSettings {
        fake_command: Some(script),
        fake_timeout: None,
    };

    let events = EventBroker::new(pool.clone());
    let queue = JobQueue::new(pool.clone(), events.clone(), queue_config.max_attempts);
    let cancels = Arc::new(CancelRegistry::new());
    let worktrees = Arc::new(WorktreeManager::new(worktree_config.clone()));
    let pr = Arc::new(StaticPullRequester::default());

    let flow = TaskFlow::new(
        pool.clone(),
        queue.clone(),
        events.clone(),
        pr.clone(),
        Arc::clone(&cancels),
    );
    let supervisor = ExecutionSupervisor::new(
        pool.clone(),
        events.clone(),
        supervisor_config,
        Arc::clone(&cancels),
    );

    let ctx = Arc::new(WorkerContext {
        pool: pool.clone(),
        events,
        queue,
        queue_config,
        worktrees: Arc::clone(&worktrees),
        supervisor,
        flow: flow.clone(),
        settings,
    });

    Harness {
        pool,
        db_name,
        ctx,
        flow,
        worktrees,
        pr,
        cancels,
        worktree_config,
        _base: base,
        _origin,
        origin_path,
    }
}

impl Harness {
    async fn create_project_and_task(&self) -> (Project, Task) {
        let project = self
            .flow
            .create_project(
                "P",
                &self.origin_path.to_string_lossy(),
                "main",
                None,
                "fake",
            )
            .await
            .unwrap();
        let task = self
            .flow
            .create_task(project.id, "Add code tab", "Show the diff in a tab.")
            .await
            .unwrap();
        (project, task)
    }

    /// Claim the next job and run its handler, as one worker iteration.
    async fn work_one_job(&self) {
        let job = self
            .ctx
            .queue
            .claim()
            .await
            .unwrap()
            .expect("expected a claimable job");
        let cancel = CancellationToken::new();
        let result = match job.job_type {
            autodev_db::models::JobType::TaskPlanning => {
                handlers::run_planning(&self.ctx, &job, &cancel).await
            }
            autodev_db::models::JobType::TaskImplementation => {
                handlers::run_implementation(&self.ctx, &job, &cancel).await
            }
        };
        result.expect("handler failed");
        self.ctx.queue.complete(&job).await.unwrap();
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.pool.clone(),
            self.ctx.events.clone(),
            Arc::clone(&self.worktrees),
            self.pr.clone(),
            self.flow.clone(),
            Arc::clone(&self.cancels),
            self.worktree_config.clone(),
        )
    }
}

#[tokio::test]
async fn s1_happy_planning() {
    let h = build_harness().await;
    let (_project, task) = h.create_project_and_task().await;

    h.flow.transition(task.id, TaskStatus::Planning).await.unwrap();
    h.work_one_job().await;

    let task = task_db::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::PlanReviewing);
    assert!(task.branch_name.as_deref().unwrap().starts_with("task-add-code-tab-"));

    let plan = plan_db::get_live_plan_for_task(&h.pool, task.id)
        .await
        .unwrap()
        .expect("plan should exist");
    assert_eq!(plan.status, PlanStatus::Reviewing);
    assert_eq!(plan.content, "# Plan\n- step");

    let executions = exec_db::list_executions_for_task(&h.pool, task.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert_eq!(executions[0].progress, 1.0);

    let logs = execution_logs::list_logs_for_execution(&h.pool, executions[0].id)
        .await
        .unwrap();
    assert!(!logs.is_empty());
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.line, i as i64);
    }

    let worktree = wt_db::get_active_for_task(&h.pool, task.id)
        .await
        .unwrap()
        .expect("worktree should stay active");
    assert_eq!(worktree.status, WorktreeStatus::Active);

    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn s2_replan_rejects_prior_plan() {
    let h = build_harness().await;
    let (_project, task) = h.create_project_and_task().await;

    h.flow.transition(task.id, TaskStatus::Planning).await.unwrap();
    h.work_one_job().await;

    let first_plan = plan_db::get_live_plan_for_task(&h.pool, task.id)
        .await
        .unwrap()
        .unwrap();

    // Human sends it back.
    h.flow.transition(task.id, TaskStatus::Planning).await.unwrap();

    let first_plan = plan_db::get_plan(&h.pool, first_plan.id).await.unwrap().unwrap();
    assert_eq!(first_plan.status, PlanStatus::Rejected);

    h.work_one_job().await;

    let task = task_db::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::PlanReviewing);

    let plans = plan_db::list_plans_for_task(&h.pool, task.id).await.unwrap();
    assert_eq!(plans.len(), 2);
    let live = plan_db::get_live_plan_for_task(&h.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(live.id, first_plan.id);
    assert_eq!(live.status, PlanStatus::Reviewing);

    let executions = exec_db::list_executions_for_task(&h.pool, task.id).await.unwrap();
    assert_eq!(executions.len(), 2);

    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn s3_implementation_opens_pull_request() {
    let h = build_harness().await;
    let (_project, task) = h.create_project_and_task().await;

    h.flow.transition(task.id, TaskStatus::Planning).await.unwrap();
    h.work_one_job().await;

    // Approve the plan.
    h.flow.transition(task.id, TaskStatus::Implementing).await.unwrap();
    let plan = plan_db::get_live_plan_for_task(&h.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.status, PlanStatus::Approved);

    h.work_one_job().await;

    let task = task_db::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::CodeReviewing);

    let pr = pr_db::get_for_task(&h.pool, task.id)
        .await
        .unwrap()
        .expect("pull request should exist");
    assert_eq!(pr.status, PrStatus::Open);
    assert_eq!(pr.title, "Add code tab");

    // The worktree survives until the PR merges.
    let worktree = wt_db::get_active_for_task(&h.pool, task.id)
        .await
        .unwrap()
        .expect("worktree still active");
    assert!(Path::new(&worktree.path).join("implemented.txt").exists());

    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn idempotent_replay_of_planning_job() {
    let h = build_harness().await;
    let (_project, task) = h.create_project_and_task().await;

    h.flow.transition(task.id, TaskStatus::Planning).await.unwrap();
    h.work_one_job().await;

    // At-least-once delivery: the same job arrives again.
    h.ctx.queue.enqueue_planning(task.id).await.unwrap();
    h.work_one_job().await;

    // Same final state as a single delivery.
    let task = task_db::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::PlanReviewing);
    let executions = exec_db::list_executions_for_task(&h.pool, task.id).await.unwrap();
    assert_eq!(executions.len(), 1, "replay must not spawn a second execution");
    let plans = plan_db::list_plans_for_task(&h.pool, task.id).await.unwrap();
    assert_eq!(plans.len(), 1);

    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn cancelled_task_worktree_is_swept() {
    let h = build_harness().await;
    let (_project, task) = h.create_project_and_task().await;

    h.flow.transition(task.id, TaskStatus::Planning).await.unwrap();
    h.work_one_job().await;

    let worktree = wt_db::get_active_for_task(&h.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert!(Path::new(&worktree.path).exists());

    // Cancel from review; the side effect flags the worktree.
    h.flow.transition(task.id, TaskStatus::Cancelled).await.unwrap();
    let flagged = wt_db::get_worktree(&h.pool, worktree.id).await.unwrap().unwrap();
    assert_eq!(flagged.status, WorktreeStatus::Cleaning);

    h.scheduler().sweep().await;

    let cleaned = wt_db::get_worktree(&h.pool, worktree.id).await.unwrap().unwrap();
    assert_eq!(cleaned.status, WorktreeStatus::Completed);
    assert!(!Path::new(&worktree.path).exists(), "directory removed");

    drop_test_db(&h.db_name).await;
}

#[tokio::test]
async fn worktree_reused_across_planning_and_implementation() {
    let h = build_harness().await;
    let (_project, task) = h.create_project_and_task().await;

    h.flow.transition(task.id, TaskStatus::Planning).await.unwrap();
    h.work_one_job().await;
    let first = wt_db::get_active_for_task(&h.pool, task.id).await.unwrap().unwrap();

    h.flow.transition(task.id, TaskStatus::Implementing).await.unwrap();
    h.work_one_job().await;
    let second = wt_db::get_active_for_task(&h.pool, task.id).await.unwrap().unwrap();

    assert_eq!(first.id, second.id, "one worktree per task for its whole life");
    assert_eq!(first.path, second.path);

    drop_test_db(&h.db_name).await;
}
