//! Identity repository selection.
//!
//! With a database configured the service runs on PostgreSQL and applies the
//! bundled migrations before serving. Without one it keeps identities in
//! process memory, which only suits development.

use crate::config::DatabaseConfig;
use crate::services::{IdentityRepository, InMemoryRepository, PgRepository};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;

pub async fn open_repository(
    config: Option<&DatabaseConfig>,
) -> Result<Arc<dyn IdentityRepository>, AppError> {
    let Some(config) = config else {
        tracing::warn!("DATABASE_URL not set, identities are held in memory");
        return Ok(Arc::new(InMemoryRepository::new()));
    };

    let pool = create_pool(config).await?;
    run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
    Ok(Arc::new(PgRepository::new(pool)))
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!(
        max_connections = config.max_connections,
        "Connecting to identity database"
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(600))
        .connect(&config.url)
        .await
}

/// Applies `migrations/` in order. Already-applied versions are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Identity schema is current");
    Ok(())
}
