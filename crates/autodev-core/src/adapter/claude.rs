//! Claude Code adapter.
//!
//! Planning runs in plan mode so the CLI cannot touch the worktree; the
//! produced plan arrives as an `ExitPlanMode` tool_use frame in the
//! stream-json output. Implementation runs with permissions skipped since
//! the worktree is the isolation boundary.

use std::collections::HashMap;

use autodev_db::models::{Plan, Task};

use super::{CommandInvocation, CommandSpec};

const PACKAGE: &str = "@anthropic-ai/claude-code@latest";

/// Adapter for the Claude Code CLI, invoked through `npx`.
#[derive(Debug, Clone, Default)]
pub struct ClaudeCode;

impl ClaudeCode {
    pub fn new() -> Self {
        Self
    }

    fn base_args() -> Vec<String> {
        vec![
            "-y".into(),
            PACKAGE.into(),
            "-p".into(),
            "--verbose".into(),
            "--output-format=stream-json".into(),
        ]
    }

    pub fn planning_command(&self, task: &Task) -> CommandInvocation {
        let mut args = Self::base_args();
        args.push("--permission-mode=plan".into());

        let prompt = format!(
            "Plan the following task. Explore the repository, then produce a \
             step-by-step implementation plan in markdown and exit plan mode.\n\n\
             # {title}\n\n{description}",
            title = task.title,
            description = task.description,
        );

        CommandInvocation {
            command: CommandSpec {
                program: "npx".into(),
                args,
                env: HashMap::new(),
            },
            prompt,
        }
    }

    pub fn implementation_command(&self, task: &Task, plan: &Plan) -> CommandInvocation {
        let mut args = Self::base_args();
        args.push("--dangerously-skip-permissions".into());

        let prompt = format!(
            "Implement the following task according to the approved plan. \
             Make the changes directly in this working directory.\n\n\
             # {title}\n\n{description}\n\n## Approved plan\n\n{plan}",
            title = task.title,
            description = task.description,
            plan = plan.content,
        );

        CommandInvocation {
            command: CommandSpec {
                program: "npx".into(),
                args,
                env: HashMap::new(),
            },
            prompt,
        }
    }
}
