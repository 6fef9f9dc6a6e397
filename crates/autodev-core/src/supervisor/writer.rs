//! The single-consumer batching log writer.
//!
//! Receives raw lines from both stream readers, assigns monotonic line
//! numbers in arrival order, enriches lines through the adapter's parser,
//! and writes batches of up to `batch_max` entries (or whatever
//! accumulated within `flush_interval`) in one statement. After a
//! successful flush each entry is published individually to the broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use autodev_db::models::LogSource;
use autodev_db::queries::execution_logs::{self, NewExecutionLog};

use super::RawLine;
use crate::adapter::CliAdapter;
use crate::broker::{self, Event, EventBroker, kinds};
use crate::config::SupervisorConfig;

/// What the writer observed over the execution's whole stream.
#[derive(Debug)]
pub struct WriterStats {
    pub lines: u64,
    /// Whether any parsed frame carried an error marker.
    pub saw_error_frame: bool,
    /// Set when a batch could not be persisted; the execution fails.
    pub write_error: Option<String>,
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn batch_writer(
    pool: PgPool,
    events: EventBroker,
    execution_id: Uuid,
    mut rx: mpsc::Receiver<RawLine>,
    adapter: CliAdapter,
    config: SupervisorConfig,
    progress_hint: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> WriterStats {
    let mut stats = WriterStats {
        lines: 0,
        saw_error_frame: false,
        write_error: None,
    };
    let mut batch: Vec<NewExecutionLog> = Vec::with_capacity(config.batch_max.min(1024));
    let mut next_line: i64 = 0;

    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(raw) = maybe else { break };

                if stats.write_error.is_some() {
                    // Storage is gone; keep draining so the readers can
                    // finish, the execution is failing anyway.
                    continue;
                }

                let entry = enrich(&adapter, raw, next_line, &progress_hint);
                next_line += 1;
                stats.saw_error_frame |= entry.is_error;
                batch.push(entry);

                if batch.len() >= config.batch_max {
                    flush(&pool, &events, execution_id, &mut batch, &mut stats, &cancel).await;
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() && stats.write_error.is_none() {
                    flush(&pool, &events, execution_id, &mut batch, &mut stats, &cancel).await;
                }
            }
        }
    }

    if !batch.is_empty() && stats.write_error.is_none() {
        flush(&pool, &events, execution_id, &mut batch, &mut stats, &cancel).await;
    }

    stats
}

/// Turn a raw line into a log row via the adapter's parser.
fn enrich(
    adapter: &CliAdapter,
    raw: RawLine,
    line: i64,
    progress_hint: &AtomicU64,
) -> NewExecutionLog {
    // Supervisor-generated lines are not CLI output; skip frame parsing.
    let parsed = match raw.source {
        LogSource::System => crate::adapter::ParsedLine::unstructured(LogSource::System),
        source => adapter.parse_log_line(source, &raw.text),
    };

    if let Some(p) = parsed.progress {
        progress_hint.store(p.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    NewExecutionLog {
        line,
        recorded_at: Utc::now(),
        level: parsed.level,
        source: raw.source,
        message: raw.text,
        parsed_content: parsed.parsed_content,
        tool_name: parsed.tool_name,
        tool_use_id: parsed.tool_use_id,
        is_error: parsed.is_error,
    }
}

/// Write the batch in one statement, then publish each entry.
///
/// One transient retry; a second failure records the error and cancels the
/// execution scope (a supervisor that cannot persist logs must not keep
/// the CLI running).
async fn flush(
    pool: &PgPool,
    events: &EventBroker,
    execution_id: Uuid,
    batch: &mut Vec<NewExecutionLog>,
    stats: &mut WriterStats,
    cancel: &CancellationToken,
) {
    let mut attempt = 0;
    loop {
        match execution_logs::insert_log_batch(pool, execution_id, batch).await {
            Ok(_) => break,
            Err(e) if attempt == 0 => {
                attempt += 1;
                warn!(execution_id = %execution_id, error = %e, "log flush failed, retrying once");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "log flush failed, aborting execution");
                stats.write_error = Some(e.to_string());
                cancel.cancel();
                batch.clear();
                return;
            }
        }
    }

    stats.lines += batch.len() as u64;

    let channel = broker::execution_channel(execution_id);
    for entry in batch.drain(..) {
        let event = Event::new(
            kinds::EXECUTION_LOG,
            json!({
                "execution_id": execution_id,
                "line": entry.line,
                "recorded_at": entry.recorded_at,
                "level": entry.level,
                "source": entry.source,
                "message": entry.message,
                "parsed_content": entry.parsed_content,
                "tool_name": entry.tool_name,
                "tool_use_id": entry.tool_use_id,
                "is_error": entry.is_error,
            }),
        );
        events.publish(&channel, &event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodev_db::models::LogLevel;

    use crate::adapter::FakeCli;

    fn fake_adapter() -> CliAdapter {
        CliAdapter::Fake(FakeCli::new("/bin/true".into()))
    }

    #[test]
    fn enrich_assigns_line_and_source() {
        let hint = AtomicU64::new(0f64.to_bits());
        let entry = enrich(
            &fake_adapter(),
            RawLine {
                source: LogSource::Stdout,
                text: "hello".into(),
            },
            7,
            &hint,
        );
        assert_eq!(entry.line, 7);
        assert_eq!(entry.source, LogSource::Stdout);
        assert_eq!(entry.level, LogLevel::Info);
        assert!(entry.parsed_content.is_none());
    }

    #[test]
    fn enrich_records_progress_hint() {
        let hint = AtomicU64::new(0f64.to_bits());
        let _ = enrich(
            &fake_adapter(),
            RawLine {
                source: LogSource::Stdout,
                text: r#"{"type":"progress","value":0.6}"#.into(),
            },
            0,
            &hint,
        );
        assert_eq!(f64::from_bits(hint.load(Ordering::Relaxed)), 0.6);
    }

    #[test]
    fn enrich_marks_error_frames() {
        let hint = AtomicU64::new(0f64.to_bits());
        let entry = enrich(
            &fake_adapter(),
            RawLine {
                source: LogSource::Stdout,
                text: r#"{"type":"error","error":{"message":"boom"}}"#.into(),
            },
            0,
            &hint,
        );
        assert!(entry.is_error);
        assert_eq!(entry.level, LogLevel::Error);
    }

    #[test]
    fn enrich_leaves_system_lines_unparsed() {
        let hint = AtomicU64::new(0f64.to_bits());
        let entry = enrich(
            &fake_adapter(),
            RawLine {
                source: LogSource::System,
                // Would parse as a frame if it came from the CLI.
                text: r#"{"type":"error","error":{"message":"x"}}"#.into(),
            },
            0,
            &hint,
        );
        assert!(!entry.is_error);
        assert!(entry.parsed_content.is_none());
    }
}
