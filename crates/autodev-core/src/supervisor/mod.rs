//! Execution supervisor: spawns the AI-CLI child for one execution,
//! streams its stdio, persists logs in batches, tracks progress, and
//! enforces timeout and cancellation.
//!
//! Inside a single execution three cooperative tasks run under one
//! cancellation scope: a stdout reader, a stderr reader, and the exit
//! waiter (this function). Both readers feed a bounded channel consumed by
//! a single batching writer, which is what makes log line numbers
//! monotonic with no gaps regardless of stream interleaving.

mod writer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use autodev_db::models::{Execution, ExecutionStatus, ExecutionType, LogSource, Plan, Task};
use autodev_db::queries::executions as exec_db;

use crate::adapter::CliAdapter;
use crate::broker::{self, Event, EventBroker, kinds};
use crate::config::SupervisorConfig;
use crate::error::{CoreError, CoreResult};

pub use writer::WriterStats;

/// A raw line read from the child, before enrichment.
#[derive(Debug)]
pub(crate) struct RawLine {
    pub source: LogSource,
    pub text: String,
}

/// In-process map from execution id to its cancellation token.
///
/// `TaskFlow` cancels a running execution by triggering its token; the
/// scheduler's crash sweep covers executions whose owning process died.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, execution_id: Uuid, token: CancellationToken) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(execution_id, token);
    }

    fn unregister(&self, execution_id: Uuid) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&execution_id);
    }

    /// Trigger the cancel token for an execution supervised by this
    /// process. Returns whether a token was found.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = map.get(&execution_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Whether this process is currently supervising the execution.
    pub fn is_supervised(&self, execution_id: Uuid) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.contains_key(&execution_id)
    }
}

/// Everything the supervisor needs to run one execution.
pub struct RunRequest<'a> {
    pub task: &'a Task,
    pub exec_type: ExecutionType,
    pub adapter: &'a CliAdapter,
    pub worktree_path: &'a Path,
    /// Approved plan; required for implementation executions.
    pub plan: Option<&'a Plan>,
}

enum ExitCause {
    Exited(std::process::ExitStatus),
    WaitFailed(String),
    Cancelled,
    TimedOut(Duration),
}

/// Supervises AI-CLI executions.
#[derive(Clone)]
pub struct ExecutionSupervisor {
    pool: PgPool,
    events: EventBroker,
    config: SupervisorConfig,
    cancels: Arc<CancelRegistry>,
}

impl ExecutionSupervisor {
    pub fn new(
        pool: PgPool,
        events: EventBroker,
        config: SupervisorConfig,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            pool,
            events,
            config,
            cancels,
        }
    }

    /// Run one execution to a terminal state and return its final row.
    ///
    /// The returned execution is `COMPLETED`, `FAILED`, or `CANCELLED`;
    /// `Err` is reserved for failures before a child was spawned (adapter
    /// unsupported, spawn error, lost the one-running-per-task race).
    pub async fn run(
        &self,
        req: RunRequest<'_>,
        parent_cancel: &CancellationToken,
    ) -> CoreResult<Execution> {
        // Resolve the invocation first: an unsupported adapter fails
        // before any execution row exists.
        let invocation = match req.exec_type {
            ExecutionType::Planning => req.adapter.planning_command(req.task)?,
            ExecutionType::Implementation => {
                let plan = req.plan.ok_or_else(|| {
                    CoreError::Cli("implementation execution requires an approved plan".into())
                })?;
                req.adapter.implementation_command(req.task, plan)?
            }
        };

        let worktree_path = req.worktree_path.to_string_lossy();
        let execution = exec_db::insert_execution(
            &self.pool,
            req.task.id,
            req.exec_type,
            &worktree_path,
        )
        .await
        .map_err(CoreError::external)?;
        let execution_id = execution.id;

        self.publish_lifecycle(kinds::EXECUTION_CREATED, &execution).await;

        // Spawn the child with the worktree as its working directory.
        let mut cmd = Command::new(&invocation.command.program);
        cmd.args(&invocation.command.args)
            .envs(&invocation.command.env)
            .current_dir(req.worktree_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!(
                    "failed to spawn {:?}: {e}",
                    invocation.command.program
                );
                self.finish(execution_id, ExecutionStatus::Failed, 0.0, Some(&msg))
                    .await;
                return Err(CoreError::Cli(msg));
            }
        };

        // Deliver the prompt on stdin, then close it so the CLI starts.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(invocation.prompt.as_bytes()).await {
                warn!(execution_id = %execution_id, error = %e, "failed to write prompt to stdin");
            }
            drop(stdin);
        }

        let pid = child.id().unwrap_or(0) as i32;
        let rows = exec_db::mark_running(&self.pool, execution_id, pid)
            .await
            .unwrap_or(0);
        if rows == 0 {
            // Lost the one-running-per-task race (or the row was already
            // cancelled externally). Stop the child and report a conflict.
            let _ = child.kill().await;
            let msg = "execution could not start: task already has a running execution";
            self.finish(execution_id, ExecutionStatus::Failed, 0.0, Some(msg))
                .await;
            return Err(CoreError::Conflict(msg.into()));
        }

        info!(
            execution_id = %execution_id,
            task_id = %req.task.id,
            exec_type = %req.exec_type,
            adapter = req.adapter.name(),
            pid,
            "execution started"
        );
        if let Ok(Some(started)) = exec_db::get_execution(&self.pool, execution_id).await {
            self.publish_lifecycle(kinds::EXECUTION_STARTED, &started).await;
        }

        let cancel = parent_cancel.child_token();
        self.cancels.register(execution_id, cancel.clone());

        let outcome = self
            .drive(&mut child, execution_id, req.adapter, req.exec_type, &cancel)
            .await;

        self.cancels.unregister(execution_id);

        let (status, progress, error) = outcome;
        let rows = self
            .finish(execution_id, status, progress, error.as_deref())
            .await;

        let final_row = exec_db::get_execution(&self.pool, execution_id)
            .await
            .map_err(CoreError::external)?
            .ok_or(CoreError::NotFound {
                kind: "execution",
                id: execution_id,
            })?;

        if rows == 0 {
            // The row reached a terminal state through another path
            // (cross-process cancel); keep that outcome.
            debug!(execution_id = %execution_id, status = %final_row.status, "execution already terminal");
        }

        Ok(final_row)
    }

    /// Run readers, writer, progress ticker, and the exit waiter; decide
    /// the terminal status.
    async fn drive(
        &self,
        child: &mut Child,
        execution_id: Uuid,
        adapter: &CliAdapter,
        exec_type: ExecutionType,
        cancel: &CancellationToken,
    ) -> (ExecutionStatus, f64, Option<String>) {
        let timeout = adapter
            .timeout_override(exec_type)
            .unwrap_or_else(|| self.config.timeout_for(exec_type));

        let (tx, rx) = mpsc::channel::<RawLine>(self.config.buffer_ceiling);

        // Readers own the piped streams; the channel bound is the
        // backpressure ceiling (a full buffer blocks reads, never drops).
        let mut reader_handles = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            reader_handles.push(tokio::spawn(read_lines(
                stdout,
                LogSource::Stdout,
                tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            reader_handles.push(tokio::spawn(read_lines(
                stderr,
                LogSource::Stderr,
                tx.clone(),
            )));
        }

        let _ = tx
            .send(RawLine {
                source: LogSource::System,
                text: format!("execution started (pid {})", child.id().unwrap_or(0)),
            })
            .await;

        // Adapter-reported progress, shared with the ticker as f64 bits.
        let progress_hint = Arc::new(AtomicU64::new(0f64.to_bits()));

        let writer = tokio::spawn(writer::batch_writer(
            self.pool.clone(),
            self.events.clone(),
            execution_id,
            rx,
            adapter.clone(),
            self.config.clone(),
            Arc::clone(&progress_hint),
            cancel.clone(),
        ));

        let ticker = tokio::spawn(progress_ticker(
            self.pool.clone(),
            self.events.clone(),
            execution_id,
            timeout,
            self.config.progress_interval,
            Arc::clone(&progress_hint),
            cancel.clone(),
        ));

        let cause = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitCause::Exited(status),
                Err(e) => ExitCause::WaitFailed(e.to_string()),
            },
            _ = cancel.cancelled() => ExitCause::Cancelled,
            _ = tokio::time::sleep(timeout) => ExitCause::TimedOut(timeout),
        };

        if matches!(cause, ExitCause::Cancelled | ExitCause::TimedOut(_)) {
            let reason = match cause {
                ExitCause::Cancelled => "cancel requested",
                _ => "timeout reached",
            };
            let _ = tx
                .send(RawLine {
                    source: LogSource::System,
                    text: format!("{reason}, terminating child"),
                })
                .await;
            self.kill_gracefully(child).await;
        }

        // Close our own sender so the channel drains once the readers hit
        // EOF; a cancelled execution still flushes its pending batch.
        drop(tx);
        for handle in reader_handles {
            let _ = handle.await;
        }
        let stats = match writer.await {
            Ok(stats) => stats,
            Err(e) => WriterStats {
                lines: 0,
                saw_error_frame: false,
                write_error: Some(format!("log writer panicked: {e}")),
            },
        };
        ticker.abort();

        // A writer that lost storage cancels the scope itself; that is a
        // failure, not an operator cancel.
        if let Some(write_error) = stats.write_error {
            return (
                ExecutionStatus::Failed,
                current_progress(&progress_hint),
                Some(format!("log writer failed: {write_error}")),
            );
        }

        match cause {
            ExitCause::Cancelled => (
                ExecutionStatus::Cancelled,
                current_progress(&progress_hint),
                Some("execution cancelled".to_string()),
            ),
            ExitCause::TimedOut(t) => (
                ExecutionStatus::Failed,
                current_progress(&progress_hint),
                Some(CoreError::Timeout(t).to_string()),
            ),
            ExitCause::WaitFailed(e) => (
                ExecutionStatus::Failed,
                current_progress(&progress_hint),
                Some(format!("failed to wait for child: {e}")),
            ),
            ExitCause::Exited(status) => {
                if status.success() && !stats.saw_error_frame {
                    (ExecutionStatus::Completed, 1.0, None)
                } else if status.success() {
                    (
                        ExecutionStatus::Failed,
                        current_progress(&progress_hint),
                        Some("CLI reported error frames".to_string()),
                    )
                } else {
                    (
                        ExecutionStatus::Failed,
                        current_progress(&progress_hint),
                        Some(format!(
                            "CLI exited with code {}",
                            status.code().unwrap_or(-1)
                        )),
                    )
                }
            }
        }
    }

    /// SIGTERM, grace window, then SIGKILL.
    async fn kill_gracefully(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }

        match tokio::time::timeout(self.config.term_grace, child.wait()).await {
            Ok(Ok(_status)) => {
                debug!("child exited within the SIGTERM grace window");
            }
            _ => {
                debug!("child survived SIGTERM, sending SIGKILL");
                let _ = child.kill().await;
            }
        }
    }

    /// Guarded terminal update; returns affected rows (0 when the row was
    /// already terminal).
    async fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        progress: f64,
        error: Option<&str>,
    ) -> u64 {
        let rows = exec_db::finish_execution(&self.pool, execution_id, status, progress, error, None)
            .await
            .unwrap_or_else(|e| {
                warn!(execution_id = %execution_id, error = %e, "failed to persist terminal status");
                0
            });

        if rows > 0 {
            if let Ok(Some(row)) = exec_db::get_execution(&self.pool, execution_id).await {
                let kind = match status {
                    ExecutionStatus::Completed => kinds::EXECUTION_COMPLETED,
                    ExecutionStatus::Cancelled => kinds::EXECUTION_CANCELLED,
                    _ => kinds::EXECUTION_FAILED,
                };
                self.publish_lifecycle(kind, &row).await;
            }
        }

        rows
    }

    async fn publish_lifecycle(&self, kind: &str, execution: &Execution) {
        let event = Event::new(
            kind,
            json!({
                "id": execution.id,
                "task_id": execution.task_id,
                "exec_type": execution.exec_type,
                "status": execution.status,
                "progress": execution.progress,
                "error": execution.error,
            }),
        );
        self.events
            .publish(&broker::execution_channel(execution.id), &event)
            .await;
        // Task subscribers follow execution lifecycles too.
        self.events
            .publish(&broker::task_channel(execution.task_id), &event)
            .await;
    }
}

/// Read one piped stream line by line into the shared channel.
async fn read_lines(
    stream: impl tokio::io::AsyncRead + Unpin,
    source: LogSource,
    tx: mpsc::Sender<RawLine>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if text.trim().is_empty() {
                    continue;
                }
                // A send error means the writer is gone; stop reading.
                if tx.send(RawLine { source, text }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx
                    .send(RawLine {
                        source: LogSource::System,
                        text: format!("{source} read error: {e}"),
                    })
                    .await;
                break;
            }
        }
    }
}

fn current_progress(hint: &AtomicU64) -> f64 {
    f64::from_bits(hint.load(Ordering::Relaxed)).clamp(0.0, 1.0)
}

/// Publish progress at a bounded rate until the execution ends.
///
/// Progress is the adapter's hint when one arrived, otherwise a heuristic
/// bounded by elapsed wall time over the timeout, capped below 1.
async fn progress_ticker(
    pool: PgPool,
    events: EventBroker,
    execution_id: Uuid,
    timeout: Duration,
    interval: Duration,
    hint: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so events stay spaced.
    ticker.tick().await;

    let mut last_published = -1.0f64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let elapsed = started.elapsed().as_secs_f64() / timeout.as_secs_f64();
        let heuristic = elapsed.min(0.95);
        let progress = current_progress(&hint).max(heuristic);

        if (progress - last_published).abs() < 0.005 {
            continue;
        }
        last_published = progress;

        let _ = exec_db::update_progress(&pool, execution_id, progress).await;
        events
            .publish(
                &broker::execution_channel(execution_id),
                &Event::new(
                    kinds::EXECUTION_PROGRESS,
                    json!({"id": execution_id, "progress": progress}),
                ),
            )
            .await;
    }
}
