//! Cursor Agent adapter.
//!
//! Cursor's agent CLI has no plan mode, so the planning capability reports
//! unsupported; projects configured with this adapter go straight from an
//! operator-written plan to implementation.

use std::collections::HashMap;

use autodev_db::models::{Plan, Task};

use super::{CommandInvocation, CommandSpec};
use crate::error::{CoreError, CoreResult};

/// Adapter for the `cursor-agent` CLI.
#[derive(Debug, Clone, Default)]
pub struct CursorAgent;

impl CursorAgent {
    pub fn new() -> Self {
        Self
    }

    pub fn planning_command(&self, _task: &Task) -> CoreResult<CommandInvocation> {
        Err(CoreError::Cli(
            "cursor-agent does not support planning executions".into(),
        ))
    }

    pub fn implementation_command(&self, task: &Task, plan: &Plan) -> CommandInvocation {
        let prompt = format!(
            "Implement the following task according to the approved plan.\n\n\
             # {title}\n\n{description}\n\n## Approved plan\n\n{plan}",
            title = task.title,
            description = task.description,
            plan = plan.content,
        );

        CommandInvocation {
            command: CommandSpec {
                program: "cursor-agent".into(),
                args: vec![
                    "-p".into(),
                    "--output-format".into(),
                    "stream-json".into(),
                    "--force".into(),
                ],
                env: HashMap::new(),
            },
            prompt,
        }
    }
}
