//! One query module per table. Functions take a `PgPool` and plain
//! arguments; conditional updates return `rows_affected` so callers can
//! detect lost optimistic-lock races.

pub mod execution_logs;
pub mod executions;
pub mod jobs;
pub mod plans;
pub mod projects;
pub mod pull_requests;
pub mod tasks;
pub mod worktrees;
