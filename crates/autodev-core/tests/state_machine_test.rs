//! DB-backed state machine tests: the transition graph, optimistic
//! locking, and the guarantee that a refused edge leaves no trace.

use autodev_core::error::CoreError;
use autodev_core::state::{TaskStateMachine, dispatch};
use autodev_db::models::TaskStatus;
use autodev_db::queries::{projects as project_db, tasks as task_db};
use autodev_test_utils::{create_test_db, drop_test_db};
use uuid::Uuid;

async fn setup_task(pool: &sqlx::PgPool) -> autodev_db::models::Task {
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
    task_db::insert_task(pool, project.id, "Add code tab", "").await.unwrap()
}

#[tokio::test]
async fn happy_path_walks_the_whole_graph() {
    let (pool, db_name) = create_test_db().await;
    let task = setup_task(&pool).await;

    dispatch::begin_planning(&pool, task.id).await.unwrap();
    dispatch::submit_plan_for_review(&pool, task.id).await.unwrap();
    dispatch::approve_plan(&pool, task.id).await.unwrap();
    dispatch::begin_code_review(&pool, task.id).await.unwrap();
    dispatch::finish_task(&pool, task.id).await.unwrap();

    let task = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn replan_loops_back_to_planning() {
    let (pool, db_name) = create_test_db().await;
    let task = setup_task(&pool).await;

    dispatch::begin_planning(&pool, task.id).await.unwrap();
    dispatch::submit_plan_for_review(&pool, task.id).await.unwrap();
    dispatch::request_replan(&pool, task.id).await.unwrap();

    let task = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Planning);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn forbidden_edge_is_refused_without_persistence_change() {
    let (pool, db_name) = create_test_db().await;
    let task = setup_task(&pool).await;
    let before = task_db::get_task(&pool, task.id).await.unwrap().unwrap();

    // TODO -> DONE is not an edge.
    let err = TaskStateMachine::transition(&pool, task.id, TaskStatus::Todo, TaskStatus::Done)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));

    let after = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Todo);
    assert_eq!(after.updated_at, before.updated_at, "row must be untouched");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stale_expected_status_is_a_conflict() {
    let (pool, db_name) = create_test_db().await;
    let task = setup_task(&pool).await;

    dispatch::begin_planning(&pool, task.id).await.unwrap();

    // A second caller still believes the task is TODO.
    let err = TaskStateMachine::transition(&pool, task.id, TaskStatus::Todo, TaskStatus::Planning)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)), "got {err:?}");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn missing_task_is_not_found() {
    let (pool, db_name) = create_test_db().await;

    let err = TaskStateMachine::transition(
        &pool,
        Uuid::new_v4(),
        TaskStatus::Todo,
        TaskStatus::Planning,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { kind: "task", .. }));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_is_reachable_from_every_live_status() {
    let (pool, db_name) = create_test_db().await;

    for target in [
        TaskStatus::Todo,
        TaskStatus::Planning,
        TaskStatus::PlanReviewing,
        TaskStatus::Implementing,
        TaskStatus::CodeReviewing,
    ] {
        let task = setup_task(&pool).await;

        // Walk the graph up to `target`.
        let path = [
            TaskStatus::Planning,
            TaskStatus::PlanReviewing,
            TaskStatus::Implementing,
            TaskStatus::CodeReviewing,
        ];
        let mut current = TaskStatus::Todo;
        for next in path {
            if current == target {
                break;
            }
            TaskStateMachine::transition(&pool, task.id, current, next)
                .await
                .unwrap();
            current = next;
        }

        dispatch::cancel_task(&pool, task.id, target).await.unwrap();
        let task = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        // Terminal: nothing moves a cancelled task.
        let err = TaskStateMachine::transition(
            &pool,
            task.id,
            TaskStatus::Cancelled,
            TaskStatus::Planning,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    drop_test_db(&db_name).await;
}
