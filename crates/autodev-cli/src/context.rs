//! Composition root: wires the core components once per invocation.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use autodev_core::broker::EventBroker;
use autodev_core::config::OrchestratorConfig;
use autodev_core::flow::TaskFlow;
use autodev_core::pr::GhPullRequester;
use autodev_core::queue::JobQueue;
use autodev_core::queue::worker::WorkerContext;
use autodev_core::scheduler::Scheduler;
use autodev_core::supervisor::{CancelRegistry, ExecutionSupervisor};
use autodev_core::worktree::WorktreeManager;
use autodev_db::config::DbConfig;
use autodev_db::pool;

/// Everything a subcommand might need, built from config + database URL.
pub struct AppContext {
    pub pool: PgPool,
    pub config: OrchestratorConfig,
    pub events: EventBroker,
    pub flow: TaskFlow,
    pub worker_context: Arc<WorkerContext>,
    pub scheduler: Scheduler,
}

impl AppContext {
    pub async fn init(database_url: String) -> Result<Self> {
        let mut config = OrchestratorConfig::from_env();
        config.db = DbConfig::new(database_url);

        let pool = pool::create_pool(&config.db).await?;
        let events = EventBroker::new(pool.clone());
        let queue = JobQueue::new(pool.clone(), events.clone(), config.queue.max_attempts);
        let cancels = Arc::new(CancelRegistry::new());
        let worktrees = Arc::new(WorktreeManager::new(config.worktree.clone()));
        let pr = Arc::new(GhPullRequester::new(
            config.github.clone(),
            config.app_base_url.clone(),
        ));

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
            config.supervisor.clone(),
            Arc::clone(&cancels),
        );

        let worker_context = Arc::new(WorkerContext {
            pool: pool.clone(),
            events: events.clone(),
            queue: queue.clone(),
            queue_config: config.queue.clone(),
            worktrees: Arc::clone(&worktrees),
            supervisor,
            flow: flow.clone(),
            settings: config.adapters.clone(),
        });

        let scheduler = Scheduler::new(
            pool.clone(),
            events.clone(),
            worktrees,
            pr,
            flow.clone(),
            cancels,
            config.worktree.clone(),
        );

        Ok(Self {
            pool,
            config,
            events,
            flow,
            worker_context,
            scheduler,
        })
    }
}
