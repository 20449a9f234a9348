mod api;
mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use core_db::models::{Priority, Trigger};
use core_db::queries::tasks::{NewTask, Page, TaskFilter};

use core_engine::config::CoreConfig;
use core_engine::health::{
    CheckerRegistry, DatabaseChecker, DiskSpaceChecker, HealthMonitor, LogSink,
    PerformanceChecker, RootFolderChecker, SystemResourcesChecker,
};
use core_engine::pool::WorkerPoolSet;
use core_engine::planner::Planner;
use core_engine::retention::RetentionJob;
use core_engine::scheduler::{CancelOutcome, HandlerRegistry, Scheduler, TaskContext, TaskHandler};
use core_engine::store::{PgTaskStore, TaskStore};

#[derive(Parser)]
#[command(name = "taskd", about = "Background task execution and health monitoring")]
struct Cli {
    /// Database URL (overrides TASKCORE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file (no database required)
    Init,
    /// Submit a task for execution
    Submit {
        /// Display name for the task
        name: String,
        /// Command name; must be registered with a handler
        command: String,
        /// JSON request body
        #[arg(long, default_value = "{}")]
        body: String,
        /// Priority: high, normal, low
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    /// Show task status (omit task_id to list recent tasks)
    Status {
        /// Task id to show (omit to list all)
        task_id: Option<i64>,
        /// Filter the list by status name
        #[arg(long)]
        status: Option<String>,
    },
    /// Cancel a queued or running task
    Cancel {
        /// Task id to cancel
        task_id: i64,
    },
    /// Run one health sweep and print the resulting issues
    Health {
        /// Root folders to check for existence/writability
        #[arg(long)]
        root_folder: Vec<PathBuf>,
    },
    /// Run the scheduler, planner, health monitor, and admin API
    Serve {
        /// Bind address for the admin HTTP API
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port for the admin HTTP API
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Root folders the health monitor should watch
        #[arg(long)]
        root_folder: Vec<PathBuf>,
    },
}

fn parse_priority(s: &str) -> Result<Priority> {
    match s.to_ascii_lowercase().as_str() {
        "high" => Ok(Priority::High),
        "normal" | "default" => Ok(Priority::Normal),
        "low" | "background" => Ok(Priority::Low),
        other => anyhow::bail!("unknown priority {other} (expected high, normal, or low)"),
    }
}

/// Demonstrates a long-running handler reporting incremental progress, the
/// same shape the submission-flow walkthrough describes: ten 500ms steps
/// each advancing progress by 10 points.
struct RefreshMovieHandler;

#[async_trait::async_trait]
impl TaskHandler for RefreshMovieHandler {
    fn command(&self) -> &str {
        "RefreshMovie"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        body: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        for step in 1..=10 {
            if ctx.is_cancelled() {
                anyhow::bail!("refresh cancelled");
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            ctx.report_progress(step * 10, Some("refreshing metadata")).await;
        }
        Ok(body)
    }
}

/// A quick handler representative of the recurring indexer-poll workload the
/// planner drives.
struct RssSearchHandler;

#[async_trait::async_trait]
impl TaskHandler for RssSearchHandler {
    fn command(&self) -> &str {
        "RssSearch"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        body: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        ctx.report_progress(100, Some("feeds polled")).await;
        Ok(body)
    }
}

fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_handler(RefreshMovieHandler);
    registry.register_handler(RssSearchHandler);
    registry
}

async fn build_scheduler(
    cfg: &CoreConfig,
    pool: sqlx::PgPool,
) -> Result<(Arc<dyn TaskStore>, Arc<Scheduler>)> {
    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool));
    let registry = Arc::new(build_registry());

    let configured: HashMap<String, i32> = cfg
        .task_pools
        .iter()
        .map(|(name, section)| (name.clone(), section.max_workers))
        .collect();
    let pools = Arc::new(WorkerPoolSet::bootstrap(&store, &configured).await?);

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        registry,
        pools,
        Arc::new(cfg.clone()),
    ));

    Ok((store, scheduler))
}

fn build_checkers(cfg: &CoreConfig, pool: sqlx::PgPool, store: Arc<dyn TaskStore>, root_folders: &[PathBuf]) -> CheckerRegistry {
    let mut registry = CheckerRegistry::new();
    registry.register(DatabaseChecker::new(
        pool,
        Duration::from_secs(cfg.health.database_timeout_secs),
    ));
    registry.register(DiskSpaceChecker::new(
        root_folders.first().cloned().unwrap_or_else(|| PathBuf::from("/")),
        cfg.health.disk_space_warning_threshold_bytes,
        cfg.health.disk_space_critical_threshold_bytes,
    ));
    for folder in root_folders {
        registry.register(RootFolderChecker::new(folder.clone()));
    }
    registry.register(SystemResourcesChecker::default());
    registry.register(PerformanceChecker::new(store));
    // ExternalServiceChecker is deployment-specific (indexer/download-client
    // URLs); operators wire it in by extending build_checkers for their site.
    registry
}

async fn cmd_submit(cli_db_url: Option<&str>, name: String, command: String, body: String, priority: String) -> Result<()> {
    let cfg = CoreConfig::resolve(cli_db_url)?;
    let body: serde_json::Value = serde_json::from_str(&body).context("--body must be valid JSON")?;
    let priority = parse_priority(&priority)?;

    let pool = core_db::pool::create_pool(&cfg.db).await?;
    let (_store, scheduler) = build_scheduler(&cfg, pool.clone()).await?;

    let outcome = scheduler
        .submit(NewTask {
            name: &name,
            command: &command,
            body,
            priority,
            trigger: Trigger::Manual,
            deadline_ms: None,
            scheduled_task_name: None,
        })
        .await?;

    if outcome.reused {
        println!("task {} already in flight for this schedule", outcome.task_id);
    } else {
        println!("submitted task {}", outcome.task_id);
    }

    pool.close().await;
    Ok(())
}

async fn cmd_status(cli_db_url: Option<&str>, task_id: Option<i64>, status: Option<String>) -> Result<()> {
    let cfg = CoreConfig::resolve(cli_db_url)?;
    let pool = core_db::pool::create_pool(&cfg.db).await?;
    let (_store, scheduler) = build_scheduler(&cfg, pool.clone()).await?;

    if let Some(id) = task_id {
        let task = scheduler.get_task(id).await?;
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        let statuses = match status {
            Some(s) => Some(vec![s.parse().map_err(|_| anyhow::anyhow!("invalid status {s}"))?]),
            None => None,
        };
        let filter = TaskFilter {
            statuses,
            ..Default::default()
        };
        let tasks = scheduler.list(&filter, Page { offset: 0, limit: 50 }).await?;
        for task in tasks {
            println!(
                "{:>6}  {:<10}  {:<16}  {:>3}%  {}",
                task.id,
                task.status.to_string(),
                task.command,
                task.progress_percent,
                task.name
            );
        }
    }

    pool.close().await;
    Ok(())
}

async fn cmd_cancel(cli_db_url: Option<&str>, task_id: i64) -> Result<()> {
    let cfg = CoreConfig::resolve(cli_db_url)?;
    let pool = core_db::pool::create_pool(&cfg.db).await?;
    let (_store, scheduler) = build_scheduler(&cfg, pool.clone()).await?;

    match scheduler.cancel(task_id).await? {
        CancelOutcome::Cancelled => println!("task {task_id} cancelled"),
        CancelOutcome::AlreadyTerminal => println!("task {task_id} is already terminal"),
        CancelOutcome::NotFound => {
            pool.close().await;
            anyhow::bail!("task {task_id} not found");
        }
    }

    pool.close().await;
    Ok(())
}

async fn cmd_health(cli_db_url: Option<&str>, root_folders: Vec<PathBuf>) -> Result<()> {
    let cfg = CoreConfig::resolve(cli_db_url)?;
    let pool = core_db::pool::create_pool(&cfg.db).await?;
    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool.clone()));

    let checkers = build_checkers(&cfg, pool.clone(), Arc::clone(&store), &root_folders);
    let monitor = HealthMonitor::new(Arc::clone(&store), checkers, Arc::new(LogSink), cfg.health.clone());
    monitor.sweep().await?;

    let issues = store.list_issues(true).await?;
    if issues.is_empty() {
        println!("no unresolved issues");
    }
    for issue in issues {
        println!("[{:?}] {} -- {}", issue.severity, issue.source, issue.message);
    }

    pool.close().await;
    Ok(())
}

async fn cmd_serve(cli_db_url: Option<&str>, bind: String, port: u16, root_folders: Vec<PathBuf>) -> Result<()> {
    let cfg = CoreConfig::resolve(cli_db_url)?;
    let pool = core_db::pool::create_pool(&cfg.db).await?;
    let (store, scheduler) = build_scheduler(&cfg, pool.clone()).await?;

    let checkers = build_checkers(&cfg, pool.clone(), Arc::clone(&store), &root_folders);
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&store),
        checkers,
        Arc::new(LogSink),
        cfg.health.clone(),
    ));

    let planner = Planner::new(Arc::clone(&store), Arc::clone(&scheduler));
    let retention = RetentionJob::new(Arc::clone(&store), Arc::new(cfg.clone()));

    let cancel = CancellationToken::new();

    if let Ok(reaped) = scheduler.reap_orphaned().await {
        if reaped > 0 {
            tracing::warn!(reaped, "recovered orphaned tasks from a prior crash");
        }
    }

    let scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    let planner_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { planner.run(cancel).await }
    });

    let health_handle = tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let cancel = cancel.clone();
        let interval_secs = cfg.health.interval_secs;
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.sweep().await {
                            tracing::warn!(error = %e, "health sweep failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }
    });

    let retention_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = retention.run().await {
                            tracing::warn!(error = %e, "retention sweep failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }
    });

    let app_state = api::AppState {
        scheduler: Arc::clone(&scheduler),
        store: Arc::clone(&store),
    };

    tokio::select! {
        result = api::run_serve(app_state, &bind, port) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
        }
    }

    cancel.cancel();
    let _ = scheduler_handle.await;
    let _ = planner_handle.await;
    let _ = health_handle.await;
    retention_handle.abort();

    pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let path = config::init_config_file()?;
            println!("config written to {}", path.display());
        }
        Commands::Submit {
            name,
            command,
            body,
            priority,
        } => {
            cmd_submit(cli.database_url.as_deref(), name, command, body, priority).await?;
        }
        Commands::Status { task_id, status } => {
            cmd_status(cli.database_url.as_deref(), task_id, status).await?;
        }
        Commands::Cancel { task_id } => {
            cmd_cancel(cli.database_url.as_deref(), task_id).await?;
        }
        Commands::Health { root_folder } => {
            cmd_health(cli.database_url.as_deref(), root_folder).await?;
        }
        Commands::Serve { bind, port, root_folder } => {
            cmd_serve(cli.database_url.as_deref(), bind, port, root_folder).await?;
        }
    }

    Ok(())
}
