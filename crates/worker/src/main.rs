mod handlers;

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use workforge_infra::config::WorkerConfig;
use workforge_infra::queue::{Dispatcher, HandlerRegistry, PostgresWorkItemStore, WorkItemStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    workforge_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let database_url = config.require_database_url()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;

    let postgres = PostgresWorkItemStore::new(pool);
    postgres
        .ensure_schema()
        .await
        .context("failed to create work_items schema")?;
    let store: Arc<dyn WorkItemStore> = Arc::new(postgres);

    let mut registry = HandlerRegistry::new();
    handlers::register_builtin(&mut registry, store.clone(), config.lease_duration)?;

    let handle = Dispatcher::new(store, Arc::new(registry), config.dispatcher_config()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested; waiting for the current item");

    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(
        processed = stats.processed,
        completed = stats.completed,
        failed = stats.failed,
        "worker stopped"
    );
    Ok(())
}
