//! Execution supervisor tests driven by fake CLI shell scripts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use autodev_core::adapter::{CliAdapter, FakeCli};
use autodev_core::broker::EventBroker;
use autodev_core::config::SupervisorConfig;
use autodev_core::error::CoreError;
use autodev_core::supervisor::{CancelRegistry, ExecutionSupervisor, RunRequest};
use autodev_db::models::{ExecutionStatus, ExecutionType, LogSource, Task};
use autodev_db::queries::{
    execution_logs, executions as exec_db, projects as project_db, tasks as task_db,
};
use autodev_test_utils::{create_test_db, drop_test_db};

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        planning_timeout: Duration::from_secs(30),
        implementation_timeout: Duration::from_secs(30),
        batch_max: 1000,
        flush_interval: Duration::from_millis(100),
        buffer_ceiling: 10_000,
        term_grace: Duration::from_secs(1),
        progress_interval: Duration::from_millis(500),
    }
}

fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

async fn setup(pool: &sqlx::PgPool) -> Task {
    let project = project_db::insert_project(
        pool,
        "p",
        "https://github.com/acme/x.git",
        "main",
        None,
        "fake",
    )
    .await
    .unwrap();
    task_db::insert_task(pool, project.id, "Add code tab", "Show the diff.")
        .await
        .unwrap()
}

fn supervisor(pool: &sqlx::PgPool, cancels: Arc<CancelRegistry>) -> ExecutionSupervisor {
    ExecutionSupervisor::new(
        pool.clone(),
        EventBroker::new(pool.clone()),
        test_config(),
        cancels,
    )
}

#[tokio::test]
async fn happy_stream_completes_with_monotonic_logs() {
    let (pool, db_name) = create_test_db().await;
    let task = setup(&pool).await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(
        tmp.path(),
        "fake_cli.sh",
        "#!/bin/sh\n\
         echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"thinking\"}]}}'\n\
         echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"id\":\"toolu_01\",\"name\":\"Bash\",\"input\":{\"command\":\"ls\"}}]}}'\n\
         echo 'plain progress text' >&2\n\
         echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\"}'\n",
    );

    let adapter = CliAdapter::Fake(FakeCli::new(script));
    let sup = supervisor(&pool, Arc::new(CancelRegistry::new()));

    let execution = sup
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Planning,
                adapter: &adapter,
                worktree_path: tmp.path(),
                plan: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.progress, 1.0);
    assert!(execution.error.is_none());
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());
    assert!(execution.pid.is_none(), "pid cleared after exit");

    let logs = execution_logs::list_logs_for_execution(&pool, execution.id)
        .await
        .unwrap();
    assert!(logs.len() >= 5, "expected all lines persisted, got {}", logs.len());
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.line, i as i64, "monotonic lines with no gaps");
    }

    assert!(logs.iter().any(|l| l.source == LogSource::System));
    assert!(logs.iter().any(|l| l.source == LogSource::Stderr));
    assert!(
        logs.iter()
            .any(|l| l.tool_name.as_deref() == Some("Bash")
                && l.tool_use_id.as_deref() == Some("toolu_01")),
        "tool_use frame should be enriched"
    );

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn nonzero_exit_fails_execution() {
    let (pool, db_name) = create_test_db().await;
    let task = setup(&pool).await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(tmp.path(), "fail.sh", "#!/bin/sh\necho starting\nexit 3\n");
    let adapter = CliAdapter::Fake(FakeCli::new(script));
    let sup = supervisor(&pool, Arc::new(CancelRegistry::new()));

    let execution = sup
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Planning,
                adapter: &adapter,
                worktree_path: tmp.path(),
                plan: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.as_deref().unwrap().contains("exited with code 3"));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn error_frames_fail_even_with_exit_zero() {
    let (pool, db_name) = create_test_db().await;
    let task = setup(&pool).await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(
        tmp.path(),
        "error_frame.sh",
        "#!/bin/sh\n\
         echo '{\"type\":\"error\",\"error\":{\"message\":\"rate limited\"}}'\n\
         exit 0\n",
    );
    let adapter = CliAdapter::Fake(FakeCli::new(script));
    let sup = supervisor(&pool, Arc::new(CancelRegistry::new()));

    let execution = sup
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Planning,
                adapter: &adapter,
                worktree_path: tmp.path(),
                plan: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.as_deref().unwrap().contains("error frames"));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn timeout_kills_child_and_flushes_logs() {
    let (pool, db_name) = create_test_db().await;
    let task = setup(&pool).await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(
        tmp.path(),
        "sleepy.sh",
        "#!/bin/sh\necho '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working\"}]}}'\nsleep 600\n",
    );
    let adapter =
        CliAdapter::Fake(FakeCli::new(script).with_timeout(Duration::from_secs(2)));
    let sup = supervisor(&pool, Arc::new(CancelRegistry::new()));

    let execution = sup
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Planning,
                adapter: &adapter,
                worktree_path: tmp.path(),
                plan: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.as_deref().unwrap().contains("timed out"));

    // The child must be gone from the OS.
    let running = exec_db::get_running_for_task(&pool, task.id).await.unwrap();
    assert!(running.is_none());

    // Everything produced before the kill is persisted.
    let logs = execution_logs::list_logs_for_execution(&pool, execution.id)
        .await
        .unwrap();
    assert!(!logs.is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_mid_run_flushes_and_records_error() {
    let (pool, db_name) = create_test_db().await;
    let task = setup(&pool).await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(
        tmp.path(),
        "long.sh",
        "#!/bin/sh\necho '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"step 1\"}]}}'\nsleep 600\n",
    );

    let cancels = Arc::new(CancelRegistry::new());
    let sup = supervisor(&pool, Arc::clone(&cancels));
    let adapter = CliAdapter::Fake(FakeCli::new(script));

    let pool_clone = pool.clone();
    let task_clone = task.clone();
    let tmp_path = tmp.path().to_path_buf();
    let sup_clone = sup.clone();
    let handle = tokio::spawn(async move {
        sup_clone
            .run(
                RunRequest {
                    task: &task_clone,
                    exec_type: ExecutionType::Implementation,
                    adapter: &adapter,
                    worktree_path: &tmp_path,
                    plan: Some(&autodev_db::models::Plan {
                        id: uuid::Uuid::new_v4(),
                        task_id: task_clone.id,
                        content: "plan".into(),
                        status: autodev_db::models::PlanStatus::Approved,
                        created_at: chrono::Utc::now(),
                        updated_at: chrono::Utc::now(),
                    }),
                },
                &CancellationToken::new(),
            )
            .await
    });

    // Wait for the execution to be RUNNING, then cancel it by id.
    let mut execution_id = None;
    for _ in 0..100 {
        if let Some(e) = exec_db::get_running_for_task(&pool_clone, task.id).await.unwrap() {
            execution_id = Some(e.id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let execution_id = execution_id.expect("execution never reached RUNNING");
    assert!(cancels.cancel(execution_id), "registry should know the execution");

    let execution = tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("cancel must settle within 15s")
        .unwrap()
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert!(execution.error.as_deref().is_some_and(|e| !e.is_empty()));

    let logs = execution_logs::list_logs_for_execution(&pool, execution.id)
        .await
        .unwrap();
    assert!(!logs.is_empty(), "logs produced before cancel are persisted");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn large_output_respects_batching() {
    let (pool, db_name) = create_test_db().await;
    let task = setup(&pool).await;
    let tmp = tempfile::tempdir().unwrap();

    // 2500 lines forces several size-triggered flushes with batch_max 1000.
    let script = write_script(
        tmp.path(),
        "chatty.sh",
        "#!/bin/sh\ni=0\nwhile [ $i -lt 2500 ]; do\n  echo \"line $i\"\n  i=$((i+1))\ndone\n",
    );
    let adapter = CliAdapter::Fake(FakeCli::new(script));
    let sup = supervisor(&pool, Arc::new(CancelRegistry::new()));

    let execution = sup
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Planning,
                adapter: &adapter,
                worktree_path: tmp.path(),
                plan: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);

    let count = execution_logs::count_logs_for_execution(&pool, execution.id)
        .await
        .unwrap();
    // 2500 stdout lines + the system start line.
    assert_eq!(count, 2501);

    let logs = execution_logs::list_logs_for_execution(&pool, execution.id)
        .await
        .unwrap();
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.line, i as i64);
    }

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn second_running_execution_is_a_conflict() {
    let (pool, db_name) = create_test_db().await;
    let task = setup(&pool).await;
    let tmp = tempfile::tempdir().unwrap();

    // Occupy the RUNNING slot directly.
    let blocker = exec_db::insert_execution(&pool, task.id, ExecutionType::Planning, "/w")
        .await
        .unwrap();
    exec_db::mark_running(&pool, blocker.id, 999_999).await.unwrap();

    let script = write_script(tmp.path(), "noop.sh", "#!/bin/sh\nsleep 30\n");
    let adapter = CliAdapter::Fake(FakeCli::new(script));
    let sup = supervisor(&pool, Arc::new(CancelRegistry::new()));

    let err = sup
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Planning,
                adapter: &adapter,
                worktree_path: tmp.path(),
                plan: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Conflict(_)), "got {err:?}");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn implementation_without_plan_is_refused_before_spawn() {
    let (pool, db_name) = create_test_db().await;
    let task = setup(&pool).await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(tmp.path(), "unused.sh", "#!/bin/sh\nexit 0\n");
    let adapter = CliAdapter::Fake(FakeCli::new(script));
    let sup = supervisor(&pool, Arc::new(CancelRegistry::new()));

    let err = sup
        .run(
            RunRequest {
                task: &task,
                exec_type: ExecutionType::Implementation,
                adapter: &adapter,
                worktree_path: tmp.path(),
                plan: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cli(_)));

    // No execution row was created.
    let executions = exec_db::list_executions_for_task(&pool, task.id).await.unwrap();
    assert!(executions.is_empty());

    drop_test_db(&db_name).await;
}
