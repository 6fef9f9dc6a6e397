//! Database query functions for the `execution_logs` table.
//!
//! Logs arrive from the supervisor in batches of up to a thousand rows, so
//! the insert path is a single multi-row statement over `UNNEST` arrays.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExecutionLog, LogLevel, LogSource};

/// Parameters for one execution log row, pre-assignment of the DB defaults.
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub line: i64,
    pub recorded_at: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub parsed_content: Option<Value>,
    pub tool_name: Option<String>,
    pub tool_use_id: Option<String>,
    pub is_error: bool,
}

/// Insert a batch of log rows for one execution in a single statement.
///
/// Returns the number of rows written. The `(execution_id, line)` primary
/// key rejects duplicates, which keeps replays from overwriting lines that
/// were persisted before a crash.
pub async fn insert_log_batch(
    pool: &PgPool,
    execution_id: Uuid,
    entries: &[NewExecutionLog],
) -> Result<u64> {
    if entries.is_empty() {
        return Ok(0);
    }

    let mut lines = Vec::with_capacity(entries.len());
    let mut recorded = Vec::with_capacity(entries.len());
    let mut levels = Vec::with_capacity(entries.len());
    let mut sources = Vec::with_capacity(entries.len());
    let mut messages = Vec::with_capacity(entries.len());
    let mut parsed = Vec::with_capacity(entries.len());
    let mut tool_names = Vec::with_capacity(entries.len());
    let mut tool_use_ids = Vec::with_capacity(entries.len());
    let mut is_errors = Vec::with_capacity(entries.len());

    for e in entries {
        lines.push(e.line);
        recorded.push(e.recorded_at);
        levels.push(e.level.to_string());
        sources.push(e.source.to_string());
        messages.push(e.message.clone());
        parsed.push(e.parsed_content.clone());
        tool_names.push(e.tool_name.clone());
        tool_use_ids.push(e.tool_use_id.clone());
        is_errors.push(e.is_error);
    }

    let result = sqlx::query(
        "INSERT INTO execution_logs \
             (execution_id, line, recorded_at, level, source, message, \
              parsed_content, tool_name, tool_use_id, is_error) \
         SELECT $1, u.line, u.recorded_at, u.level, u.source, u.message, \
                u.parsed_content, u.tool_name, u.tool_use_id, u.is_error \
         FROM UNNEST($2::bigint[], $3::timestamptz[], $4::text[], $5::text[], \
                     $6::text[], $7::jsonb[], $8::text[], $9::text[], $10::boolean[]) \
              AS u(line, recorded_at, level, source, message, \
                   parsed_content, tool_name, tool_use_id, is_error) \
         ON CONFLICT (execution_id, line) DO NOTHING",
    )
    .bind(execution_id)
    .bind(&lines)
    .bind(&recorded)
    .bind(&levels)
    .bind(&sources)
    .bind(&messages)
    .bind(&parsed)
    .bind(&tool_names)
    .bind(&tool_use_ids)
    .bind(&is_errors)
    .execute(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert {} log rows for execution {}",
            entries.len(),
            execution_id
        )
    })?;

    Ok(result.rows_affected())
}

/// List all logs for an execution in line order.
pub async fn list_logs_for_execution(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Vec<ExecutionLog>> {
    let logs = sqlx::query_as::<_, ExecutionLog>(
        "SELECT * FROM execution_logs WHERE execution_id = $1 ORDER BY line ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list logs for execution {execution_id}"))?;

    Ok(logs)
}

/// Highest line number recorded for an execution, or `None` when empty.
pub async fn max_line_for_execution(pool: &PgPool, execution_id: Uuid) -> Result<Option<i64>> {
    let row: (Option<i64>,) =
        sqlx::query_as("SELECT MAX(line) FROM execution_logs WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_one(pool)
            .await
            .context("failed to fetch max log line")?;

    Ok(row.0)
}

/// Count the logs recorded for an execution.
pub async fn count_logs_for_execution(pool: &PgPool, execution_id: Uuid) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM execution_logs WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_one(pool)
            .await
            .context("failed to count execution logs")?;

    Ok(row.0)
}
