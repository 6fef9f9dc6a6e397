//! Durable queue behavior: priority-weighted claims, the retry envelope,
//! dead-lettering, and backpressure.

use chrono::Utc;

use autodev_core::broker::EventBroker;
use autodev_core::error::CoreError;
use autodev_core::queue::{FailureDisposition, JobQueue, backoff_for};
use autodev_db::models::{JobStatus, JobType};
use autodev_db::queries::{jobs as job_db, projects as project_db, tasks as task_db};
use autodev_test_utils::{create_test_db, drop_test_db};

async fn setup_task(pool: &sqlx::PgPool) -> uuid::Uuid {
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
    task_db::insert_task(pool, project.id, "t", "").await.unwrap().id
}

fn queue_for(pool: &sqlx::PgPool) -> JobQueue {
    JobQueue::new(pool.clone(), EventBroker::new(pool.clone()), 3)
}

#[tokio::test]
async fn claim_returns_none_when_empty() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);

    assert!(queue.claim().await.unwrap().is_none());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn enqueue_claim_complete_round_trip() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);
    let task_id = setup_task(&pool).await;

    let job = queue.enqueue_planning(task_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.queue, "planning");
    assert_eq!(job.priority, 4);
    assert_eq!(job.attempt, 0);

    let claimed = queue.claim().await.unwrap().expect("job should be claimable");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempt, 1);

    // Claimed jobs are invisible to other workers.
    assert!(queue.claim().await.unwrap().is_none());

    queue.complete(&claimed).await.unwrap();
    let stored = job_db::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.finished_at.is_some());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn higher_weight_claims_first() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);
    let task_a = setup_task(&pool).await;
    let task_b = setup_task(&pool).await;

    // default:1 enqueued before critical:6.
    job_db::enqueue_job(&pool, JobType::TaskPlanning, task_a, "default", 1, 3)
        .await
        .unwrap();
    job_db::enqueue_job(&pool, JobType::TaskPlanning, task_b, "critical", 6, 3)
        .await
        .unwrap();

    let first = queue.claim().await.unwrap().unwrap();
    assert_eq!(first.queue, "critical");
    let second = queue.claim().await.unwrap().unwrap();
    assert_eq!(second.queue, "default");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn transient_failure_requeues_with_backoff() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);
    let task_id = setup_task(&pool).await;

    queue.enqueue_planning(task_id).await.unwrap();
    let job = queue.claim().await.unwrap().unwrap();

    let before = Utc::now();
    let disposition = queue
        .fail(&job, &CoreError::external(std::io::Error::other("git broke")))
        .await
        .unwrap();
    assert_eq!(disposition, FailureDisposition::Retried(backoff_for(1)));

    let stored = job_db::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert!(stored.last_error.as_deref().unwrap().contains("git broke"));
    assert!(stored.run_at > before, "run_at must move into the future");

    // Not claimable until the backoff elapses.
    assert!(queue.claim().await.unwrap().is_none());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn exhausted_retries_dead_letter() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);
    let task_id = setup_task(&pool).await;

    queue.enqueue_planning(task_id).await.unwrap();

    for attempt in 1..=3 {
        // Make the job immediately claimable again.
        sqlx::query("UPDATE jobs SET run_at = NOW() WHERE task_id = $1")
            .bind(task_id)
            .execute(&pool)
            .await
            .unwrap();
        let job = queue.claim().await.unwrap().expect("claimable");
        assert_eq!(job.attempt, attempt);

        let disposition = queue
            .fail(&job, &CoreError::external(std::io::Error::other("still broken")))
            .await
            .unwrap();

        if attempt < 3 {
            assert!(matches!(disposition, FailureDisposition::Retried(_)));
        } else {
            assert_eq!(disposition, FailureDisposition::Dead);
        }
    }

    let jobs: Vec<(String,)> =
        sqlx::query_as("SELECT status FROM jobs WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(jobs, vec![("DEAD".to_string(),)]);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn non_retryable_failure_dead_letters_immediately() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);
    let task_id = setup_task(&pool).await;

    queue.enqueue_planning(task_id).await.unwrap();
    let job = queue.claim().await.unwrap().unwrap();

    let disposition = queue
        .fail(&job, &CoreError::Cli("no ExitPlanMode frame".into()))
        .await
        .unwrap();
    assert_eq!(disposition, FailureDisposition::Dead);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn backpressure_never_dead_letters() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);
    let task_id = setup_task(&pool).await;

    queue.enqueue_planning(task_id).await.unwrap();

    // Far past the attempt cap, ResourceExhausted still requeues.
    for _ in 0..5 {
        sqlx::query("UPDATE jobs SET run_at = NOW() WHERE task_id = $1")
            .bind(task_id)
            .execute(&pool)
            .await
            .unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        let disposition = queue
            .fail(&job, &CoreError::ResourceExhausted("project at capacity".into()))
            .await
            .unwrap();
        assert!(matches!(disposition, FailureDisposition::Retried(_)));
    }

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stuck_running_jobs_are_released() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);
    let task_id = setup_task(&pool).await;

    queue.enqueue_planning(task_id).await.unwrap();
    let job = queue.claim().await.unwrap().unwrap();

    // Pretend the claim is ancient (the worker died).
    sqlx::query("UPDATE jobs SET claimed_at = NOW() - INTERVAL '3 hours' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .unwrap();

    let released = job_db::reset_stuck_jobs(&pool, 2 * 60 * 60).await.unwrap();
    assert_eq!(released, 1);
    assert!(queue.claim().await.unwrap().is_some());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn live_job_visibility() {
    let (pool, db_name) = create_test_db().await;
    let queue = queue_for(&pool);
    let task_id = setup_task(&pool).await;

    assert!(
        !job_db::has_live_job_for_task(&pool, task_id, JobType::TaskPlanning)
            .await
            .unwrap()
    );

    queue.enqueue_planning(task_id).await.unwrap();
    assert!(
        job_db::has_live_job_for_task(&pool, task_id, JobType::TaskPlanning)
            .await
            .unwrap()
    );
    assert!(
        !job_db::has_live_job_for_task(&pool, task_id, JobType::TaskImplementation)
            .await
            .unwrap()
    );

    let job = queue.claim().await.unwrap().unwrap();
    queue.complete(&job).await.unwrap();
    assert!(
        !job_db::has_live_job_for_task(&pool, task_id, JobType::TaskPlanning)
            .await
            .unwrap()
    );

    drop_test_db(&db_name).await;
}
