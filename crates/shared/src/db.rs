//! Database pool construction

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Connection pool tuning
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Connection attempts before giving up at startup
    pub connect_attempts: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            connect_attempts: 5,
        }
    }
}

/// Create a Postgres pool, retrying the initial connection with backoff.
///
/// Containers frequently start before the database accepts connections, so
/// the first connect is retried instead of failing the process outright.
pub async fn create_pool(database_url: &str, settings: &PoolSettings) -> Result<PgPool, sqlx::Error> {
    let strategy = ExponentialBackoff::from_millis(200)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(settings.connect_attempts.saturating_sub(1));

    let pool = Retry::spawn(strategy, || async {
        PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Database connection attempt failed");
                e
            })
    })
    .await?;

    tracing::info!(
        max_connections = settings.max_connections,
        "Database pool created"
    );
    Ok(pool)
}
