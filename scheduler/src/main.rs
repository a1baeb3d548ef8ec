// Scheduler binary entry point
//
// Drives the scheduling core: one tick per poll interval, a purge of old
// soft-deleted jobs per purge interval, until Ctrl+C.

use anyhow::{Context, Result};
use scheduler_core::config::Settings;
use scheduler_core::db::{DbPool, PgJobLogRepository, PgSchedulerStore, RedisPool};
use scheduler_core::events::{EventDispatcher, EventPublisher, NatsClient, NatsEventPublisher};
use scheduler_core::lock::{DistributedLock, RedLock};
use scheduler_core::schedule::CronExpressionEvaluator;
use scheduler_core::scheduler::{
    JobRegistry, LocalJobPool, SchedulerComponents, SchedulerConfig, SchedulerService,
};
use scheduler_core::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(&settings.observability)?;

    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!(
        database_url = %settings.database.url,
        redis_url = %settings.redis.url,
        nats_url = %settings.nats.url,
        "Configuration loaded"
    );

    telemetry::init_metrics(settings.observability.metrics_port)?;

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;
    db_pool
        .migrate()
        .await
        .context("Failed to run database migrations")?;
    info!("Database connection pool initialized");

    let redis_pool = RedisPool::new(&settings.redis)
        .await
        .context("Failed to initialize Redis pool")?;
    let lock = Arc::new(RedLock::new(redis_pool)) as Arc<dyn DistributedLock>;
    info!("Distributed lock initialized");

    let nats_client = NatsClient::new(settings.nats.clone())
        .await
        .context("Failed to initialize NATS client")?;
    nats_client
        .initialize_stream()
        .await
        .context("Failed to initialize NATS stream")?;
    let publisher = Arc::new(NatsEventPublisher::new(nats_client)) as Arc<dyn EventPublisher>;
    let (events, dispatcher) = EventDispatcher::spawn(publisher);
    info!("Event dispatcher started");

    let cron = CronExpressionEvaluator::with_timezone_name(&settings.scheduler.timezone)
        .context("Invalid scheduler timezone")?;

    let registry = JobRegistry::with_builtin_jobs();
    info!(classes = ?registry.classes(), "Job classes registered");

    let service = SchedulerService::new(
        SchedulerConfig::from(&settings.scheduler),
        SchedulerComponents {
            store: Arc::new(PgSchedulerStore::new(db_pool.clone())),
            log_sink: Arc::new(PgJobLogRepository::new(db_pool.clone())),
            lock,
            cron: Arc::new(cron),
            events,
            pool: Arc::new(LocalJobPool::new(settings.scheduler.worker_concurrency)),
            registry: Arc::new(registry),
        },
    );

    run(&service, &settings).await;

    // Dropping the service closes the event bus so the dispatcher can drain
    drop(service);
    if tokio::time::timeout(Duration::from_secs(5), dispatcher)
        .await
        .is_err()
    {
        warn!("Event dispatcher did not drain before shutdown");
    }

    db_pool.close().await;
    telemetry::shutdown_tracer();
    info!("Scheduler stopped");
    Ok(())
}

async fn run(service: &SchedulerService, settings: &Settings) {
    let mut ticks = interval(Duration::from_secs(settings.scheduler.poll_interval_seconds));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut purges = interval(Duration::from_secs(
        settings.scheduler.purge_interval_seconds.max(1),
    ));
    purges.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        poll_interval_seconds = settings.scheduler.poll_interval_seconds,
        purge_interval_seconds = settings.scheduler.purge_interval_seconds,
        "Starting scheduler loop"
    );

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                // A failed tick changed nothing; the next one retries
                if let Err(e) = service.execute().await {
                    error!(error = %e, retryable = e.is_retryable(), "Scheduler tick failed");
                }
            }
            _ = purges.tick() => {
                if let Err(e) = service.clear_job_details().await {
                    error!(error = %e, "Failed to purge deleted jobs");
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received, stopping scheduler");
                break;
            }
        }
    }
}
