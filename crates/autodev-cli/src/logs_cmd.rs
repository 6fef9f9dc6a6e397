//! `autodev logs`: print an execution's stored log, optionally following
//! live events from the broker.

use anyhow::Result;
use futures::StreamExt;

use autodev_core::broker::{self, kinds};
use autodev_db::queries::execution_logs;

use crate::context::AppContext;
use crate::project_cmds::parse_id;

pub async fn run(ctx: &AppContext, execution_id: &str, follow: bool) -> Result<()> {
    let execution_id = parse_id(execution_id)?;

    // Subscribe before reading so no live line lands in the gap; the line
    // numbers make replayed duplicates easy to spot.
    let stream = if follow {
        Some(
            ctx.events
                .subscribe(&[broker::execution_channel(execution_id)])
                .await?,
        )
    } else {
        None
    };

    let logs = execution_logs::list_logs_for_execution(&ctx.pool, execution_id).await?;
    let mut last_line = -1i64;
    for log in logs {
        println!(
            "{:>6}  {:5}  {:6}  {}",
            log.line,
            log.level.to_string(),
            log.source.to_string(),
            log.message
        );
        last_line = log.line;
    }

    let Some(mut stream) = stream else {
        return Ok(());
    };

    while let Some(channel_event) = stream.next().await {
        let event = channel_event.event;
        match event.kind.as_str() {
            kinds::EXECUTION_LOG => {
                let line = event.data.get("line").and_then(|v| v.as_i64()).unwrap_or(-1);
                if line <= last_line {
                    continue;
                }
                last_line = line;
                println!(
                    "{:>6}  {:5}  {:6}  {}",
                    line,
                    event.data.get("level").and_then(|v| v.as_str()).unwrap_or("?"),
                    event.data.get("source").and_then(|v| v.as_str()).unwrap_or("?"),
                    event.data.get("message").and_then(|v| v.as_str()).unwrap_or("")
                );
            }
            kinds::EXECUTION_COMPLETED | kinds::EXECUTION_FAILED | kinds::EXECUTION_CANCELLED => {
                println!("-- {} --", event.kind);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
