//! Batched log insertion and the per-execution line monotonicity it must
//! preserve across batch sizes and replays.

use chrono::Utc;
use serde_json::json;

use autodev_db::models::{ExecutionType, LogLevel, LogSource};
use autodev_db::queries::execution_logs::{self, NewExecutionLog};
use autodev_db::queries::{executions as exec_db, projects as project_db, tasks as task_db};
use autodev_test_utils::{create_test_db, drop_test_db};

fn entry(line: i64, message: &str) -> NewExecutionLog {
    NewExecutionLog {
        line,
        recorded_at: Utc::now(),
        level: LogLevel::Info,
        source: LogSource::Stdout,
        message: message.to_string(),
        parsed_content: None,
        tool_name: None,
        tool_use_id: None,
        is_error: false,
    }
}

async fn setup(pool: &sqlx::PgPool) -> uuid::Uuid {
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
    let task = task_db::insert_task(pool, project.id, "t", "").await.unwrap();
    exec_db::insert_execution(pool, task.id, ExecutionType::Planning, "/w")
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn batch_insert_round_trip() {
    let (pool, db_name) = create_test_db().await;
    let execution_id = setup(&pool).await;

    let batch: Vec<NewExecutionLog> = (0..250).map(|i| entry(i, &format!("line {i}"))).collect();
    let written = execution_logs::insert_log_batch(&pool, execution_id, &batch)
        .await
        .unwrap();
    assert_eq!(written, 250);

    let logs = execution_logs::list_logs_for_execution(&pool, execution_id)
        .await
        .unwrap();
    assert_eq!(logs.len(), 250);
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.line, i as i64, "lines must be 0..n with no gaps");
    }
    assert_eq!(
        execution_logs::max_line_for_execution(&pool, execution_id)
            .await
            .unwrap(),
        Some(249)
    );

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn batch_insert_preserves_enrichment() {
    let (pool, db_name) = create_test_db().await;
    let execution_id = setup(&pool).await;

    let mut rich = entry(0, r#"{"type":"assistant"}"#);
    rich.level = LogLevel::Error;
    rich.source = LogSource::Stderr;
    rich.parsed_content = Some(json!({"type": "assistant", "message": {"content": []}}));
    rich.tool_name = Some("Bash".into());
    rich.tool_use_id = Some("toolu_01".into());
    rich.is_error = true;

    execution_logs::insert_log_batch(&pool, execution_id, &[rich])
        .await
        .unwrap();

    let logs = execution_logs::list_logs_for_execution(&pool, execution_id)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.level, LogLevel::Error);
    assert_eq!(log.source, LogSource::Stderr);
    assert_eq!(log.tool_name.as_deref(), Some("Bash"));
    assert_eq!(log.tool_use_id.as_deref(), Some("toolu_01"));
    assert!(log.is_error);
    assert!(log.parsed_content.is_some());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn replayed_lines_do_not_overwrite() {
    let (pool, db_name) = create_test_db().await;
    let execution_id = setup(&pool).await;

    execution_logs::insert_log_batch(&pool, execution_id, &[entry(0, "original")])
        .await
        .unwrap();

    // A crash-restart replay of the same line is ignored, not overwritten.
    let written = execution_logs::insert_log_batch(
        &pool,
        execution_id,
        &[entry(0, "replayed"), entry(1, "new")],
    )
    .await
    .unwrap();
    assert_eq!(written, 1);

    let logs = execution_logs::list_logs_for_execution(&pool, execution_id)
        .await
        .unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "original");
    assert_eq!(logs[1].message, "new");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn empty_batch_is_a_noop() {
    let (pool, db_name) = create_test_db().await;
    let execution_id = setup(&pool).await;

    let written = execution_logs::insert_log_batch(&pool, execution_id, &[])
        .await
        .unwrap();
    assert_eq!(written, 0);
    assert_eq!(
        execution_logs::count_logs_for_execution(&pool, execution_id)
            .await
            .unwrap(),
        0
    );

    drop_test_db(&db_name).await;
}
