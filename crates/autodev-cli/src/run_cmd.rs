//! `autodev run`: the long-lived runtime hosting the worker pool and the
//! scheduler, all under one root cancellation scope.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use autodev_core::queue::worker::WorkerPool;

use crate::context::AppContext;

pub async fn run(database_url: String, workers: Option<usize>) -> Result<()> {
    if let Some(workers) = workers {
        // AppContext reads worker count from the environment section.
        unsafe { std::env::set_var("AUTODEV_WORKERS", workers.to_string()) };
    }

    let ctx = AppContext::init(database_url).await?;

    let root = CancellationToken::new();
    let pool = WorkerPool::new(ctx.worker_context.clone());

    let worker_cancel = root.clone();
    let workers_task = tokio::spawn(async move { pool.run(worker_cancel).await });

    let scheduler = ctx.scheduler;
    let scheduler_cancel = root.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_cancel).await });

    wait_for_shutdown_signal().await;
    info!("shutdown requested, draining");
    root.cancel();

    let _ = workers_task.await;
    let _ = scheduler_task.await;

    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
