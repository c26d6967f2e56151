//! Benchrun worker
//!
//! Runs one driver of a load run: configures a controller from the
//! environment, drives the sample scenario until the queue drains or Ctrl-C,
//! then logs a summary of the recorded results.

mod config;
mod scenario;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use benchrun_driver::prelude::*;
use sqlx::PgPool;

use config::{StoreKind, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("Failed to load .env");
        }
    }
    telemetry::init_tracing();

    tracing::info!("benchrun-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    match config.store {
        StoreKind::Memory => {
            let store = Arc::new(InMemoryStore::new());
            run(&config, store.clone(), store.clone(), store).await
        }
        StoreKind::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL not set")?;
            let pool = PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            let store = PostgresStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("Failed to prepare database schema")?;
            if config.reset {
                tracing::warn!("Clearing previous run data");
                store.clear_all().await.context("Failed to clear tables")?;
            }
            let store = Arc::new(store);
            run(&config, store.clone(), store.clone(), store).await
        }
    }
}

async fn run(
    config: &WorkerConfig,
    events: Arc<dyn EventStore>,
    results: Arc<dyn ResultStore>,
    sessions: Arc<dyn SessionStore>,
) -> Result<()> {
    let (processors, producers) = scenario::build(config)?;
    let queue = Arc::new(EventQueue::new(events, QueueConfig::default()));
    let controller_config = config.controller_config();

    tracing::info!(
        driver_id = %controller_config.driver_id,
        store = ?config.store,
        thread_count = controller_config.thread_count,
        events_per_second = controller_config.events_per_second(),
        event_count = config.event_count,
        "Starting driver"
    );

    let controller = EventController::new(
        controller_config,
        queue,
        results.clone(),
        sessions,
        Arc::new(processors),
        Arc::new(producers),
    );
    controller.start()?;

    tokio::select! {
        _ = controller.wait_for_completion() => {
            tracing::info!("Run complete");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }
    controller.stop().await;

    summarize(results.as_ref()).await?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}

async fn summarize(results: &dyn ResultStore) -> Result<()> {
    let total = results.count_results().await?;
    let successes = results.count_successes().await?;
    let failures = results.count_failures().await?;
    tracing::info!(total, successes, failures, "Result summary");

    for name in results.event_names().await? {
        let count = results.count_results_by_event_name(&name).await?;
        tracing::info!(event_name = %name, count, "Results by event");
    }

    if let (Some(first), Some(last)) = (results.first_result().await?, results.last_result().await?) {
        let span = last.start_time - first.start_time;
        tracing::info!(span_ms = span.num_milliseconds(), "Run span");
    }
    Ok(())
}
