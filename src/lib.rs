pub mod config;
pub mod db;
pub mod dispatch;
pub mod erx;
pub mod lock;
pub mod models;
pub mod pipeline;
pub mod queue;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use config::{ConfigError, PipelineConfig, ROUTING_QUEUE, STATUS_QUEUE};
use db::DatabaseError;
use dispatch::Dispatcher;
use erx::{GatewayError, HttpErxGateway, ThrottledGateway};
use lock::{LeaseError, SqliteLease};
use pipeline::PipelineContext;
use queue::{QueueError, QueueStore};

/// Failures that stop the process before the workers are running.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue store error: {0}")]
    Queue(#[from] QueueError),

    #[error("Lease store error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Gateway client error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Could not spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Start the worker fleet and block until it stops.
pub fn run() -> Result<(), StartupError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = PipelineConfig::from_env()?;
    let db_path = config.database_path.clone();

    // Migrate once up front so workers never race on the schema.
    db::open_database(&db_path)?;

    let http = HttpErxGateway::new(
        &config.gateway_base_url,
        config.gateway_api_key.clone(),
        config.gateway_timeout,
    )?;
    let gateway = ThrottledGateway::new(http, config.gateway_concurrency);
    let store = QueueStore::open(&db_path)?;
    let lease = SqliteLease::open(&db_path, &config.instance_id)?;

    let ctx = PipelineContext {
        gateway: Arc::new(gateway),
        routing_queue: Arc::new(store.queue(ROUTING_QUEUE)),
        status_queue: Arc::new(store.queue(STATUS_QUEUE)),
        lease: Arc::new(lease),
        dispatcher: Arc::new(Dispatcher::with_logging()),
        config,
    };

    tracing::info!(
        db = %db_path.display(),
        gateway = %ctx.config.gateway_base_url,
        instance = %ctx.config.instance_id,
        "Pipeline configured"
    );
    let workers = pipeline::start_workers(ctx, &db_path)?;
    workers.wait();
    tracing::info!("All workers stopped");
    Ok(())
}
