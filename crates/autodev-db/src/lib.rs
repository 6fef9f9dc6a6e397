//! Persistence layer: models, pool management, migrations, and query
//! functions for the orchestrator's relational schema.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
