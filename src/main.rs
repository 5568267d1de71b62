//! # Mirror Sync Entry Point
//!
//! Runs the worker pool and failover monitor, and exposes operator
//! commands for migrations, configuration, metrics and job control.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use mirror_sync::adapters::ProviderRegistry;
use mirror_sync::config::{AppConfig, ConfigLoader};
use mirror_sync::db;
use mirror_sync::failover::FailoverMonitor;
use mirror_sync::orchestrator::{JobOrchestrator, JobStatusView};
use mirror_sync::processor::SyncProcessor;
use mirror_sync::queue::DurableQueue;
use mirror_sync::repositories::{
    CatalogRepository, FailoverEventRepository, JobStore, ProviderRepository, SyncJobRepository,
};
use mirror_sync::telemetry;
use mirror_sync::worker::WorkerPool;

#[derive(Parser)]
#[command(name = "mirror-sync")]
#[command(about = "Mirror one repository across several Git hosting providers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool and failover monitor until interrupted
    Worker {
        /// Worker name used in logs and lease ownership
        #[arg(long, default_value = "sync-worker")]
        name: String,
    },
    /// Apply pending database migrations
    Migrate,
    /// Print the effective configuration with secrets masked
    CheckConfig,
    /// Print job and queue counts
    Metrics,
    /// Retry failed jobs; every retryable job when no id is given
    Retry {
        #[arg(long = "job")]
        jobs: Vec<Uuid>,
    },
    /// Cancel a job
    Cancel { job_id: Uuid },
    /// Show a job's status
    Status { job_id: Uuid },
    /// Resolve an active failover event
    ResolveFailover { event_id: Uuid },
}

struct Services {
    db: Arc<DatabaseConnection>,
    jobs: Arc<dyn JobStore>,
    catalog: CatalogRepository,
    providers: ProviderRepository,
    queue: DurableQueue,
}

impl Services {
    async fn connect(config: &AppConfig) -> Result<Self> {
        let db = Arc::new(
            db::init_pool(config)
                .await
                .context("initializing database connection pool")?,
        );
        db::health_check(&db).await?;
        let queue = DurableQueue::connect(db.clone(), config.queue.clone())
            .await
            .context("connecting queue")?;

        Ok(Self {
            jobs: Arc::new(SyncJobRepository::new(db.clone())),
            catalog: CatalogRepository::new(db.clone()),
            providers: ProviderRepository::new(db.clone()),
            queue,
            db,
        })
    }

    fn orchestrator(&self) -> JobOrchestrator {
        JobOrchestrator::new(self.jobs.clone(), self.catalog.clone(), self.queue.clone())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    match cli.command {
        Commands::CheckConfig => {
            println!("Loaded configuration for profile: {}", config.profile);
            println!("{}", config.redacted_json()?);
        }
        Commands::Migrate => {
            let pool = db::init_pool(&config)
                .await
                .context("initializing database connection pool")?;
            db::migrate(&pool).await?;
            info!("Migrations applied");
        }
        Commands::Worker { name } => run_worker(&config, name).await?,
        Commands::Metrics => {
            let services = Services::connect(&config).await?;
            let orchestrator = services.orchestrator();
            print_json(&serde_json::json!({
                "jobs": orchestrator.metrics().await?,
                "queue": orchestrator.queue_counts().await?,
            }))?;
        }
        Commands::Retry { jobs } => {
            let services = Services::connect(&config).await?;
            let ids = (!jobs.is_empty()).then_some(jobs.as_slice());
            let outcomes = services.orchestrator().bulk_retry(ids).await?;
            print_json(&outcomes)?;
        }
        Commands::Cancel { job_id } => {
            let services = Services::connect(&config).await?;
            let job = services.orchestrator().cancel(job_id).await?;
            print_json(&JobStatusView::from(&job))?;
        }
        Commands::Status { job_id } => {
            let services = Services::connect(&config).await?;
            print_json(&services.orchestrator().job_status(job_id).await?)?;
        }
        Commands::ResolveFailover { event_id } => {
            let services = Services::connect(&config).await?;
            let monitor = failover_monitor(&config, &services);
            let event = monitor.resolve_failover(event_id).await?;
            print_json(&serde_json::json!({
                "id": event.id,
                "status": event.status,
                "duration_seconds": event.duration_seconds,
            }))?;
        }
    }

    Ok(())
}

fn failover_monitor(config: &AppConfig, services: &Services) -> FailoverMonitor {
    FailoverMonitor::new(
        services.providers.clone(),
        FailoverEventRepository::new(services.db.clone()),
        services.catalog.clone(),
        services.jobs.clone(),
        Arc::new(ProviderRegistry::with_defaults(config.providers.clone())),
        config.failover.clone(),
    )
}

async fn run_worker(config: &AppConfig, name: String) -> Result<()> {
    let services = Services::connect(config).await?;
    let registry = Arc::new(ProviderRegistry::with_defaults(config.providers.clone()));

    let processor = SyncProcessor::new(
        services.jobs.clone(),
        services.catalog.clone(),
        services.providers.clone(),
        registry,
        &config.sync_author,
    )
    .with_job_timeout(config.worker.job_timeout());

    let pool = WorkerPool::new(
        name,
        services.queue.clone(),
        Arc::new(processor),
        services.jobs.clone(),
        config.worker.clone(),
    );

    let shutdown = CancellationToken::new();
    let monitor = tokio::spawn(failover_monitor(config, &services).run(shutdown.clone()));

    pool.start().await;
    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    pool.stop().await;
    if let Err(err) = monitor.await {
        warn!(error = %err, "Failover monitor task panicked");
    }

    let Services {
        db,
        jobs,
        catalog,
        providers,
        queue,
    } = services;
    drop((pool, db, jobs, catalog, providers));
    queue.close().await.context("closing queue")?;
    Ok(())
}
