mod config;
mod context;
mod logs_cmd;
mod project_cmds;
mod run_cmd;
mod status_cmd;
mod task_cmds;

use anyhow::Result;
use clap::{Parser, Subcommand};

use autodev_db::config::DbConfig;
use autodev_db::pool;

use config::resolve_database_url;
use context::AppContext;

#[derive(Parser)]
#[command(name = "autodev", about = "Development automation orchestrator")]
struct Cli {
    /// Database URL (overrides AUTODEV_DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the autodev config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database (if needed) and apply migrations
    DbInit,
    /// Project management
    Project {
        #[command(subcommand)]
        command: project_cmds::ProjectCommands,
    },
    /// Task management and lifecycle transitions
    Task {
        #[command(subcommand)]
        command: task_cmds::TaskCommands,
    },
    /// Run the worker pool and scheduler
    Run {
        /// Worker pool size (overrides AUTODEV_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show an execution's log, optionally following live output
    Logs {
        /// Execution ID
        execution_id: String,
        /// Keep following events after printing stored logs
        #[arg(long)]
        follow: bool,
    },
    /// Show the task board and queue counters
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            config::save_config(&config::ConfigFile {
                database: config::DatabaseSection { url: db_url },
            })?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Commands::DbInit => {
            let db = DbConfig::new(resolve_database_url(cli.database_url));
            pool::ensure_database_exists(&db).await?;
            let pg = pool::create_pool(&db).await?;
            pool::run_migrations(&pg).await?;
            println!("database ready at {}", db.database_url);
            Ok(())
        }
        Commands::Project { command } => {
            let ctx = AppContext::init(resolve_database_url(cli.database_url)).await?;
            project_cmds::run(&ctx, command).await
        }
        Commands::Task { command } => {
            let ctx = AppContext::init(resolve_database_url(cli.database_url)).await?;
            task_cmds::run(&ctx, command).await
        }
        Commands::Run { workers } => {
            run_cmd::run(resolve_database_url(cli.database_url), workers).await
        }
        Commands::Logs {
            execution_id,
            follow,
        } => {
            let ctx = AppContext::init(resolve_database_url(cli.database_url)).await?;
            logs_cmd::run(&ctx, &execution_id, follow).await
        }
        Commands::Status => {
            let ctx = AppContext::init(resolve_database_url(cli.database_url)).await?;
            status_cmd::run(&ctx).await
        }
    }
}
