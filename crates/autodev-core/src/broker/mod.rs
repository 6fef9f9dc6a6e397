//! Event broker: publish/subscribe fanout over Postgres `NOTIFY`/`LISTEN`.
//!
//! Channel conventions:
//! - `task:{task_id}` -- status changes, plan updates.
//! - `project:{project_id}` -- membership/board updates.
//! - `execution:{execution_id}` -- execution lifecycle + log events.
//!
//! Delivery is best-effort for live subscribers; the database is the
//! durable truth and clients reconcile on reconnect. Publish errors are
//! logged and never fail the originating operation.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::{debug, warn};
use uuid::Uuid;

/// Postgres rejects NOTIFY payloads near 8000 bytes; events above this are
/// re-serialized without their heaviest field.
const MAX_PAYLOAD_BYTES: usize = 7500;

/// Channel name for a task's events.
pub fn task_channel(task_id: Uuid) -> String {
    format!("task:{task_id}")
}

/// Channel name for a project's events.
pub fn project_channel(project_id: Uuid) -> String {
    format!("project:{project_id}")
}

/// Channel name for an execution's events.
pub fn execution_channel(execution_id: Uuid) -> String {
    format!("execution:{execution_id}")
}

/// A broker message: `{type, data, ts}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            ts: Utc::now(),
        }
    }
}

/// Event kinds published by the core.
pub mod kinds {
    pub const TASK_CREATED: &str = "task_created";
    pub const TASK_UPDATED: &str = "task_updated";
    pub const TASK_DELETED: &str = "task_deleted";
    pub const TASK_STATUS_CHANGED: &str = "task_status_changed";
    pub const PLAN_CREATED: &str = "plan_created";
    pub const PLAN_UPDATED: &str = "plan_updated";
    pub const EXECUTION_CREATED: &str = "execution_created";
    pub const EXECUTION_STARTED: &str = "execution_started";
    pub const EXECUTION_PROGRESS: &str = "execution_progress";
    pub const EXECUTION_COMPLETED: &str = "execution_completed";
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const EXECUTION_CANCELLED: &str = "execution_cancelled";
    pub const EXECUTION_LOG: &str = "execution_log";
    pub const PROJECT_UPDATED: &str = "project_updated";
    pub const PULL_REQUEST_UPDATED: &str = "pull_request_updated";
    pub const JOB_FAILED: &str = "job_failed";
}

/// An event received from a subscription, tagged with its channel.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel: String,
    pub event: Event,
}

/// Pub/sub fanout over the shared Postgres transport.
#[derive(Clone)]
pub struct EventBroker {
    pool: PgPool,
}

impl EventBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Publish an event to a channel.
    ///
    /// Best-effort: failures are logged and swallowed so a dropped event
    /// can never fail the operation that produced it.
    pub async fn publish(&self, channel: &str, event: &Event) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(channel, error = %e, "failed to serialize event, dropping");
                return;
            }
        };

        let payload = if payload.len() > MAX_PAYLOAD_BYTES {
            slim_payload(event)
        } else {
            payload
        };

        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&payload)
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            warn!(channel, kind = %event.kind, error = %e, "event publish failed (best-effort)");
        } else {
            debug!(channel, kind = %event.kind, "published event");
        }
    }

    /// Subscribe to a set of channels.
    ///
    /// Yields every event published to any of the channels for as long as
    /// the stream is polled. Malformed payloads are skipped with a warning.
    pub async fn subscribe(
        &self,
        channels: &[String],
    ) -> anyhow::Result<BoxStream<'static, ChannelEvent>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        let refs: Vec<&str> = channels.iter().map(String::as_str).collect();
        listener.listen_all(refs).await?;

        Ok(Box::pin(async_stream::stream! {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let channel = notification.channel().to_string();
                        match serde_json::from_str::<Event>(notification.payload()) {
                            Ok(event) => yield ChannelEvent { channel, event },
                            Err(e) => {
                                warn!(channel, error = %e, "skipping malformed event payload");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "listener error, ending subscription");
                        break;
                    }
                }
            }
        }))
    }
}

/// Re-serialize an event without its `parsed_content` field.
///
/// Log events carry the raw structured frame; when that pushes the payload
/// over the NOTIFY limit, subscribers still get the line metadata and can
/// fetch the full row over REST.
fn slim_payload(event: &Event) -> String {
    let mut slim = event.clone();
    if let Value::Object(ref mut map) = slim.data {
        map.remove("parsed_content");
        map.insert("truncated".to_string(), Value::Bool(true));
    }
    serde_json::to_string(&slim).unwrap_or_else(|_| {
        // Fall back to a bare envelope; the row remains the durable truth.
        format!(
            "{{\"type\":{:?},\"data\":{{\"truncated\":true}},\"ts\":{:?}}}",
            slim.kind,
            slim.ts.to_rfc3339()
        )
    })
}
