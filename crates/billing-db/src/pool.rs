//! Postgres pool and schema migrations

use billing_core::{AppError, AppResult};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info};

/// Pool size used when none is configured
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Name reported in `pg_stat_activity`
const APPLICATION_NAME: &str = "paas-billing";

/// Connect to the billing database and verify the connection
///
/// ```no_run
/// # async fn connect() -> billing_db::AppResult<()> {
/// let pool = billing_db::create_pool("postgresql://localhost/paas_billing", Some(5)).await?;
/// billing_db::run_migrations(&pool).await?;
/// # Ok(())
/// # }
/// ```
pub async fn create_pool(database_url: &str, max_connections: Option<u32>) -> AppResult<PgPool> {
    let options: PgConnectOptions = database_url
        .parse()
        .map_err(|e| AppError::Config(format!("invalid database url: {}", e)))?;
    let max_connections = max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .test_before_acquire(true)
        .connect_with(options.application_name(APPLICATION_NAME))
        .await
        .map_err(|e| {
            error!("Cannot reach billing database: {}", e);
            AppError::Pool(e.to_string())
        })?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| AppError::Database(format!("connection check: {}", e)))?;

    info!("Billing database pool ready ({} connections max)", max_connections);
    Ok(pool)
}

/// Bring the schema up to date with the bundled migrations
pub async fn run_migrations(pool: &PgPool) -> AppResult<()> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        error!("Schema migration failed: {}", e);
        AppError::Database(format!("migration: {}", e))
    })?;

    info!("Billing schema migrated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bad_url_is_config_error() {
        let result = create_pool("not a url", None).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_create_pool_and_migrate() {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/paas_billing".to_string());

        let pool = create_pool(&database_url, Some(2)).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
