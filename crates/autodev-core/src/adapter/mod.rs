//! CLI adapters: the pluggable mapping from a task to an external AI
//! coding CLI invocation and its output parsers.
//!
//! Adapters are a tagged variant rather than a trait-object registry: the
//! supervisor treats them as interchangeable behind the capability set
//! (`planning_command`, `implementation_command`, `parse_log_line`,
//! `parse_output_to_plan`, `parse_progress`), and a new CLI is added by
//! extending the enum.

pub mod claude;
pub mod cursor;
pub mod fake;
pub mod stream_json;

use std::collections::HashMap;
use std::time::Duration;

use autodev_db::models::{ExecutionLog, ExecutionType, LogLevel, LogSource, Plan, Task};
use tracing::warn;

use crate::config::AdapterSettings;
use crate::error::{CoreError, CoreResult};

pub use claude::ClaudeCode;
pub use cursor::CursorAgent;
pub use fake::FakeCli;

/// A command line ready to spawn: program, arguments, extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// A command plus the prompt to deliver on the child's stdin.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub command: CommandSpec,
    pub prompt: String,
}

/// The structured pieces an adapter extracts from one output line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub level: LogLevel,
    pub parsed_content: Option<serde_json::Value>,
    pub tool_name: Option<String>,
    pub tool_use_id: Option<String>,
    pub is_error: bool,
    /// Progress fraction, when the adapter recognized one in the line.
    pub progress: Option<f64>,
}

impl ParsedLine {
    /// An unstructured line: plain message, level derived from the source.
    pub fn unstructured(source: LogSource) -> Self {
        Self {
            level: default_level(source),
            parsed_content: None,
            tool_name: None,
            tool_use_id: None,
            is_error: false,
            progress: None,
        }
    }
}

fn default_level(source: LogSource) -> LogLevel {
    match source {
        LogSource::Stdout => LogLevel::Info,
        LogSource::Stderr => LogLevel::Warn,
        LogSource::System => LogLevel::Info,
    }
}

/// The available CLI adapters.
#[derive(Debug, Clone)]
pub enum CliAdapter {
    Claude(ClaudeCode),
    Cursor(CursorAgent),
    Fake(FakeCli),
}

impl CliAdapter {
    /// Resolve an adapter by its configured name (`projects.cli_adapter`).
    pub fn from_name(name: &str, settings: &AdapterSettings) -> CoreResult<Self> {
        match name {
            "claude-code" => Ok(Self::Claude(ClaudeCode::new())),
            "cursor-agent" => Ok(Self::Cursor(CursorAgent::new())),
            "fake" => {
                let command = settings.fake_command.clone().ok_or_else(|| {
                    CoreError::Cli(
                        "fake adapter selected but no fake command configured".into(),
                    )
                })?;
                let mut fake = FakeCli::new(command);
                if let Some(timeout) = settings.fake_timeout {
                    fake = fake.with_timeout(timeout);
                }
                Ok(Self::Fake(fake))
            }
            other => Err(CoreError::Cli(format!("unknown CLI adapter: {other:?}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Claude(_) => "claude-code",
            Self::Cursor(_) => "cursor-agent",
            Self::Fake(_) => "fake",
        }
    }

    /// Build the planning invocation, or report that this CLI cannot plan.
    pub fn planning_command(&self, task: &Task) -> CoreResult<CommandInvocation> {
        match self {
            Self::Claude(a) => Ok(a.planning_command(task)),
            Self::Cursor(a) => a.planning_command(task),
            Self::Fake(a) => Ok(a.command(task, ExecutionType::Planning)),
        }
    }

    /// Build the implementation invocation for an approved plan.
    pub fn implementation_command(&self, task: &Task, plan: &Plan) -> CoreResult<CommandInvocation> {
        match self {
            Self::Claude(a) => Ok(a.implementation_command(task, plan)),
            Self::Cursor(a) => Ok(a.implementation_command(task, plan)),
            Self::Fake(a) => Ok(a.command(task, ExecutionType::Implementation)),
        }
    }

    /// Parse one raw output line into log enrichment data.
    ///
    /// All current adapters speak the same `stream-json` framing; lines
    /// that are not structured frames come back as plain messages.
    pub fn parse_log_line(&self, source: LogSource, line: &str) -> ParsedLine {
        let Some(frame) = stream_json::parse_frame(line) else {
            return ParsedLine::unstructured(source);
        };

        ParsedLine {
            level: if frame.is_error {
                LogLevel::Error
            } else {
                default_level(source)
            },
            parsed_content: Some(frame.value),
            tool_name: frame.tool_name,
            tool_use_id: frame.tool_use_id,
            is_error: frame.is_error,
            progress: frame.progress,
        }
    }

    /// Extract the plan markdown from a planning execution's logs.
    ///
    /// The stream is expected to carry exactly one `ExitPlanMode` frame;
    /// the first one wins and extras are logged. Zero frames is a CLI
    /// failure.
    pub fn parse_output_to_plan(&self, logs: &[ExecutionLog]) -> CoreResult<String> {
        let mut plans = logs
            .iter()
            .filter_map(|log| log.parsed_content.as_ref())
            .filter_map(stream_json::extract_plan);

        let Some(first) = plans.next() else {
            return Err(CoreError::Cli(
                "planning output contained no ExitPlanMode frame".into(),
            ));
        };

        let extras = plans.count();
        if extras > 0 {
            warn!(extras, "planning output contained extra ExitPlanMode frames, using the first");
        }

        Ok(first)
    }

    /// Per-adapter timeout override; `None` uses the configured default.
    pub fn timeout_override(&self, exec_type: ExecutionType) -> Option<Duration> {
        match self {
            Self::Fake(a) => a.timeout_override(exec_type),
            _ => None,
        }
    }
}
