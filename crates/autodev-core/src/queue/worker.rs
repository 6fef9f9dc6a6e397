//! The worker pool: N concurrent loops claiming jobs and dispatching them
//! to the handlers, woken by NOTIFY with a poll fallback, and drained
//! gracefully on shutdown.

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autodev_db::models::{Job, JobType};
use autodev_db::queries::jobs::JOB_NOTIFY_CHANNEL;

use super::{JobQueue, handlers};
use crate::broker::EventBroker;
use crate::config::{AdapterSettings, QueueConfig};
use crate::flow::TaskFlow;
use crate::supervisor::ExecutionSupervisor;
use crate::worktree::WorktreeManager;

/// Everything a job handler needs, wired once at start-up.
pub struct WorkerContext {
    pub pool: PgPool,
    pub events: EventBroker,
    pub queue: JobQueue,
    pub queue_config: QueueConfig,
    pub worktrees: Arc<WorktreeManager>,
    pub supervisor: ExecutionSupervisor,
    pub flow: TaskFlow,
    pub settings: AdapterSettings,
}

/// Pool of concurrent job workers.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Run the pool until `cancel` fires, then wait for in-flight handlers
    /// to drain (bounded by the configured grace window).
    pub async fn run(&self, cancel: CancellationToken) {
        let workers = self.ctx.queue_config.workers.max(1);
        info!(workers, "starting worker pool");

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let ctx = Arc::clone(&self.ctx);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(worker_loop(ctx, worker_id, cancel)));
        }

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        // The workers observe `cancel` between jobs; in-flight executions
        // receive it through the supervisor's child tokens.
        if tokio::time::timeout(self.ctx.queue_config.shutdown_grace * 2, drain)
            .await
            .is_err()
        {
            warn!("worker pool drain exceeded grace window");
        } else {
            info!("worker pool drained");
        }
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker_id: usize, cancel: CancellationToken) {
    // Per-worker listener; a broken listener degrades to pure polling.
    let mut listener = match PgListener::connect_with(&ctx.pool).await {
        Ok(mut l) => match l.listen(JOB_NOTIFY_CHANNEL).await {
            Ok(()) => Some(l),
            Err(e) => {
                warn!(worker_id, error = %e, "LISTEN failed, falling back to polling");
                None
            }
        },
        Err(e) => {
            warn!(worker_id, error = %e, "listener connection failed, falling back to polling");
            None
        }
    };

    loop {
        if cancel.is_cancelled() {
            debug!(worker_id, "worker stopping");
            break;
        }

        match ctx.queue.claim().await {
            Ok(Some(job)) => {
                handle_job(&ctx, &job, &cancel).await;
            }
            Ok(None) => {
                wait_for_work(&ctx, listener.as_mut(), &cancel).await;
            }
            Err(e) => {
                warn!(worker_id, error = %e, "claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(ctx.queue_config.poll_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
}

async fn wait_for_work(
    ctx: &WorkerContext,
    listener: Option<&mut PgListener>,
    cancel: &CancellationToken,
) {
    let poll = ctx.queue_config.poll_interval;
    match listener {
        Some(listener) => {
            tokio::select! {
                notification = listener.recv() => {
                    if let Err(e) = notification {
                        debug!(error = %e, "listener recv failed, polling instead");
                        tokio::time::sleep(poll).await;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
                _ = cancel.cancelled() => {}
            }
        }
        None => {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

async fn handle_job(ctx: &WorkerContext, job: &Job, cancel: &CancellationToken) {
    info!(
        job_id = %job.id,
        job_type = %job.job_type,
        task_id = %job.task_id,
        attempt = job.attempt,
        "handling job"
    );

    let result = match job.job_type {
        JobType::TaskPlanning => handlers::run_planning(ctx, job, cancel).await,
        JobType::TaskImplementation => handlers::run_implementation(ctx, job, cancel).await,
    };

    match result {
        Ok(()) => {
            if let Err(e) = ctx.queue.complete(job).await {
                warn!(job_id = %job.id, error = %e, "failed to mark job complete");
            }
        }
        Err(err) => {
            if let Err(e) = ctx.queue.fail(job, &err).await {
                error!(job_id = %job.id, error = %e, "failed to record job failure");
            }
        }
    }
}
