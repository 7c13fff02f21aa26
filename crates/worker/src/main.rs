//! Background worker: pulls cache tasks from Redis, runs the dashboard
//! queries against Postgres and writes the encoded results back.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use vizcache_infra::source::PostgresQuerySource;
use vizcache_infra::{Backends, CacheConfig, QueryCatalog, TaskQueue, WorkerPool};

fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to read .env");
        }
    }
    vizcache_observability::init();

    let config = CacheConfig::from_env().context("invalid configuration")?;
    let database = config
        .database
        .clone()
        .context("set DATABASE_URL or the AUGUR_* connection variables")?;

    let catalog = QueryCatalog::dashboard_defaults();
    info!(queries = catalog.len(), "loaded query catalog");
    let source = PostgresQuerySource::connect(&database.postgres_options(), catalog)
        .context("failed to set up the Postgres query source")?;

    let backends = Backends::redis(&config).context("failed to set up Redis backends")?;
    let recovered = backends
        .queue
        .recover()
        .context("failed to recover unacknowledged tasks")?;
    if recovered > 0 {
        warn!(recovered, "requeued tasks left behind by a previous run");
    }

    let dispatcher = backends.dispatcher(Arc::new(source));
    let pool = WorkerPool::new(backends.queue.clone(), Arc::new(dispatcher))
        .spawn(config.worker.clone())
        .context("failed to start worker threads")?;

    info!(
        worker = %config.worker.name,
        concurrency = config.worker.concurrency,
        namespace = %config.namespace,
        max_retries = config.retry.max_retries,
        "worker running"
    );

    wait_for_shutdown()?;

    info!("shutting down, waiting for in-flight jobs");
    let stats = pool.stats();
    pool.shutdown();
    info!(
        processed = stats.tasks_processed,
        succeeded = stats.tasks_succeeded,
        failed = stats.tasks_failed,
        abandoned = stats.tasks_abandoned,
        skipped = stats.tasks_skipped,
        uptime_secs = stats.uptime_secs,
        "worker stopped"
    );
    Ok(())
}

/// Block until SIGINT / Ctrl-C.
fn wait_for_shutdown() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for shutdown signal")
}
