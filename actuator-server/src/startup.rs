use std::sync::Arc;

use actuator_core::execution::{
    ExecutionRuntime, PostgresExecutionQueue, PostgresHeartbeatStore, PostgresIdempotencyStore,
    PostgresResultInbox, ResultApplier, verify_schema,
};
use anyhow::Context;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::adapters::DryRunAdapter;
use crate::config::{Config, DatabaseConfig};

pub async fn connect_database(database: &DatabaseConfig, url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    if database.run_migrations {
        actuator_core::MIGRATOR
            .run(&pool)
            .await
            .context("failed to apply migrations")?;
        info!("database migrations applied");
    }
    verify_schema(&pool)
        .await
        .context("execution schema check failed")?;
    Ok(pool)
}

/// Wires the runtime from configuration. Postgres backs every store when a
/// database URL is configured; otherwise the in-memory stores are used.
pub async fn build_runtime(
    config: &Config,
    applier: Arc<dyn ResultApplier>,
) -> anyhow::Result<ExecutionRuntime> {
    let mut builder = ExecutionRuntime::builder(config.execution.clone()).with_applier(applier);
    for platform in &config.platforms {
        builder = builder.with_adapter(platform.clone(), Arc::new(DryRunAdapter::new(platform)));
    }

    if let Some(url) = config.database.url.as_deref() {
        let pool = connect_database(&config.database, url).await?;
        let stale_after =
            chrono::Duration::seconds(config.execution.idempotency.stale_after_secs);
        builder = builder
            .with_queue(Arc::new(PostgresExecutionQueue::new(pool.clone())))
            .with_inbox(Arc::new(PostgresResultInbox::new(pool.clone())))
            .with_idempotency(Arc::new(PostgresIdempotencyStore::new(
                pool.clone(),
                stale_after,
            )))
            .with_heartbeats(Arc::new(PostgresHeartbeatStore::new(pool)));
        info!("execution stores backed by postgres");
    } else {
        info!("no database configured; using in-memory execution stores");
    }

    builder.build().context("failed to build execution runtime")
}
