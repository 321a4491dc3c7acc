mod batches_cmd;
mod config;
mod log_cmd;
mod pulse_cmd;
mod status_cmd;
mod tasks_cmd;

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use foreman_db::pool;

use config::ForemanConfig;

#[derive(Parser)]
#[command(name = "foreman", about = "Autonomous DevOps supervisor for AI coding workers")]
struct Cli {
    /// Path to the git repository foreman supervises (overrides FOREMAN_REPO_PATH / config file)
    #[arg(long, global = true)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// Path to the repository foreman will supervise
        #[arg(long)]
        repo: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the foreman store (creates the SQLite database and runs migrations)
    DbInit,
    /// Run one or more pulses: claim-pickup, dispatch, evaluate, reconcile, PR lifecycle, verify
    Pulse {
        /// Run exactly one pulse and exit, instead of looping forever
        #[arg(long)]
        once: bool,
        /// Seconds to sleep between pulses in loop mode
        #[arg(long, default_value_t = 300)]
        interval: u64,
    },
    /// Show a fleet-wide snapshot: task counts by status, batches and their progress
    Status,
    /// Show state-log and proof-log history for a task
    Log {
        /// Task ID
        task_id: String,
    },
    /// Inspect or cancel individual tasks
    Tasks {
        #[command(subcommand)]
        command: TasksCommands,
    },
    /// List batches with progress summaries
    Batches,
    /// Operator recovery: resume a `failed` or `blocked` task (spec §4.3 `failed/blocked -> queued`)
    Retry {
        /// Task ID to retry
        task_id: String,
    },
}

#[derive(Subcommand)]
enum TasksCommands {
    /// Show full detail for one task
    Show {
        /// Task ID
        task_id: String,
    },
    /// Cancel a task from any non-terminal state
    Cancel {
        /// Task ID to cancel
        task_id: String,
        /// Reason recorded in the state log and task-file annotation
        #[arg(long, default_value = "operator cancel")]
        reason: String,
    },
}

/// Execute the `foreman init` command: write config file.
fn cmd_init(repo: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        repo: config::RepoSection {
            path: Some(repo.to_string()),
            base_branch: None,
            task_file: None,
            verify_queue_file: None,
        },
        worker: config::WorkerSection::default(),
        limits: config::LimitsSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  repo.path = {repo}");
    println!();
    println!("Next: run `foreman db-init` to create the store, then `foreman pulse`.");

    Ok(())
}

/// Execute the `foreman db-init` command: create database and run migrations.
async fn cmd_db_init(resolved: &ForemanConfig) -> anyhow::Result<()> {
    println!("Initializing foreman store at {}...", resolved.store.db_path.display());

    resolved.paths.ensure_dirs()?;
    let db_pool = pool::create_pool(&resolved.store).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Store ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("foreman db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { repo, force } = &cli.command {
        cmd_init(repo, *force)?;
        return Ok(());
    }

    let resolved = ForemanConfig::resolve(cli.repo.as_deref())?;

    if let Commands::DbInit = &cli.command {
        cmd_db_init(&resolved).await?;
        return Ok(());
    }

    let db_pool = pool::create_pool(&resolved.store).await?;

    let result: anyhow::Result<()> = async {
        match cli.command {
            Commands::Init { .. } | Commands::DbInit => unreachable!("handled above"),
            Commands::Pulse { once, interval } => {
                pulse_cmd::run_pulse_command(&db_pool, &resolved, once, Duration::from_secs(interval)).await
            }
            Commands::Status => status_cmd::run_status(&db_pool).await,
            Commands::Log { task_id } => log_cmd::run_log(&db_pool, &task_id).await,
            Commands::Tasks { command } => match command {
                TasksCommands::Show { task_id } => tasks_cmd::run_show(&db_pool, &task_id).await,
                TasksCommands::Cancel { task_id, reason } => tasks_cmd::run_cancel(&db_pool, &task_id, &reason).await,
            },
            Commands::Batches => batches_cmd::run_batches(&db_pool).await,
            Commands::Retry { task_id } => {
                foreman_core::state::dispatch::resume_task(&db_pool, &task_id)
                    .await
                    .with_context(|| format!("failed to retry task {task_id}"))?;
                println!("Task {task_id} reset to queued for retry.");
                Ok(())
            }
        }
    }
    .await;

    db_pool.close().await;
    result?;

    Ok(())
}
