//! docket-worker: drains the stage queue until interrupted.
//!
//! Every collaborator is configured from the environment (and `.env`):
//! `DATABASE_URL`, `REDIS_URL`, `OCR_BASE_URL`, `NER_BASE_URL`,
//! `OBJECT_STORE_ROOT` and the `DOCKET_*` tuning variables documented on each
//! config type. `DOCKET_DB_POOL_LOG_SECS` sets how often pool occupancy is
//! logged.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket_cache::CacheLayer;
use docket_db::{spawn_pool_monitor, Database, PoolConfig};
use docket_jobs::{
    BatchManager, PipelineConfig, PipelineContext, PipelineWorker, StageRegistry, StageRunner,
    WorkerConfig,
};
use docket_services::{
    FilesystemObjectStore, HttpEntityClient, HttpOcrClient, OcrCallbacks, OcrWaitConfig,
    OcrWaiter,
};

/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "docket=info,docket_jobs=info")
fn init_logging() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "docket_worker=info,docket_jobs=info,docket_cache=warn".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("docket-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Seconds between pool occupancy log lines.
const POOL_LOG_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let worker_config = WorkerConfig::from_env();
    let stage_workers =
        worker_config.high_workers + worker_config.normal_workers + worker_config.low_workers;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/docket".to_string());
    let pool_config = PoolConfig::from_env().sized_for_workers(stage_workers);
    let db = Database::connect_with_config(&database_url, pool_config)
        .await
        .context("connecting to the durable store")?;
    if std::env::var("DOCKET_RUN_MIGRATIONS").map_or(true, |v| v != "false" && v != "0") {
        db.migrate().await.context("running migrations")?;
        info!("Database migrations applied");
    }
    let pool_log_secs = std::env::var("DOCKET_DB_POOL_LOG_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(POOL_LOG_SECS);
    let pool_monitor = spawn_pool_monitor(db.pool.clone(), Duration::from_secs(pool_log_secs));

    // Trips and resets are shared with every worker through the store
    let cache = CacheLayer::from_env()
        .await
        .with_health_store(Arc::new(db.store.clone()));
    if !cache.is_enabled() {
        warn!("Cache disabled, every stage reads from the durable store");
    }

    let objects = Arc::new(FilesystemObjectStore::from_env());
    let ocr = OcrWaiter::new(
        Arc::new(HttpOcrClient::from_env().context("configuring OCR client")?),
        OcrCallbacks::new(),
        OcrWaitConfig::from_env(),
    );
    let ner = Arc::new(HttpEntityClient::from_env().context("configuring entity client")?);

    let config = PipelineConfig::from_env();
    info!(
        breaker_threshold = config.breaker.threshold,
        stage_retries = config.retry.max_retries,
        memory_budget_bytes = config.large_file.memory_budget_bytes,
        ocr_hard_limit_bytes = config.large_file.hard_limit_bytes,
        "Pipeline configured"
    );

    let ctx = PipelineContext::new(
        db.durable_store(),
        db.task_queue(),
        cache,
        objects,
        ocr,
        ner,
        config,
    );
    let batches = BatchManager::new(&ctx);
    let runner = StageRunner::new(ctx, StageRegistry::standard());

    info!(
        high = worker_config.high_workers,
        normal = worker_config.normal_workers,
        low = worker_config.low_workers,
        enabled = worker_config.enabled,
        "Starting pipeline worker"
    );
    let handle = PipelineWorker::new(runner, worker_config).start();
    let tracker = batches.track(handle.events());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested, draining in-flight stages");

    handle.shutdown().await?;
    tracker.abort();
    pool_monitor.abort();
    info!("Worker stopped");
    Ok(())
}
