//! Fake adapter for tests.
//!
//! Runs an operator-supplied command (usually a shell script) in place of a
//! real AI CLI. The script receives the prompt on stdin like the real CLIs
//! and is expected to emit stream-json lines on stdout. The execution type
//! is exposed via `AUTODEV_EXEC_TYPE` so one script can serve both phases.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use autodev_db::models::{ExecutionType, Task};

use super::{CommandInvocation, CommandSpec};

/// Adapter that runs a configured command instead of a real CLI.
#[derive(Debug, Clone)]
pub struct FakeCli {
    command: PathBuf,
    timeout: Option<Duration>,
}

impl FakeCli {
    pub fn new(command: PathBuf) -> Self {
        Self {
            command,
            timeout: None,
        }
    }

    /// Override the execution timeout (used by timeout tests).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self, task: &Task, exec_type: ExecutionType) -> CommandInvocation {
        let mut env = HashMap::new();
        env.insert("AUTODEV_EXEC_TYPE".to_string(), exec_type.to_string());
        env.insert("AUTODEV_TASK_ID".to_string(), task.id.to_string());

        CommandInvocation {
            command: CommandSpec {
                program: self.command.to_string_lossy().into_owned(),
                args: Vec::new(),
                env,
            },
            prompt: format!("{}\n\n{}", task.title, task.description),
        }
    }

    pub fn timeout_override(&self, _exec_type: ExecutionType) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodev_db::models::TaskStatus;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn command_carries_exec_type_env() {
        let task = Task {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            title: "t".into(),
            description: "d".into(),
            status: TaskStatus::Planning,
            branch_name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let fake = FakeCli::new("/tmp/fake.sh".into());

        let inv = fake.command(&task, ExecutionType::Planning);
        assert_eq!(inv.command.program, "/tmp/fake.sh");
        assert_eq!(
            inv.command.env.get("AUTODEV_EXEC_TYPE").map(String::as_str),
            Some("PLANNING")
        );
        assert!(inv.prompt.starts_with("t"));
    }

    #[test]
    fn timeout_override_round_trip() {
        let fake = FakeCli::new("/tmp/fake.sh".into()).with_timeout(Duration::from_secs(5));
        assert_eq!(
            fake.timeout_override(ExecutionType::Planning),
            Some(Duration::from_secs(5))
        );
    }
}
