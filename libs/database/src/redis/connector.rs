use redis::Client;
use redis::aio::ConnectionManager;
use tracing::info;

use super::RedisConfig;
use crate::common::{DatabaseResult, RetryConfig, retry_with_backoff};

/// Connect to Redis and verify the connection with PING
///
/// The ConnectionManager reconnects on its own after a dropped connection,
/// so one manager can be cloned into every user.
///
/// # Example
/// ```ignore
/// use database::redis::{RedisConfig, connect};
///
/// let conn = connect(&RedisConfig::new("redis://127.0.0.1:6379")).await?;
/// ```
pub async fn connect(config: &RedisConfig) -> DatabaseResult<ConnectionManager> {
    let client = Client::open(config.build_url())?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!(database = config.database.unwrap_or(0), "Successfully connected to Redis");
    Ok(manager)
}

/// Connect with doubling backoff; `None` uses [`RetryConfig::default`].
pub async fn connect_with_retry(
    config: &RedisConfig,
    retry_config: Option<RetryConfig>,
) -> DatabaseResult<ConnectionManager> {
    retry_with_backoff(|| connect(config), retry_config.unwrap_or_default()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unreachable_server_fails_after_retries() {
        let config = RedisConfig::new("redis://127.0.0.1:1");
        let retry = RetryConfig::new()
            .with_max_retries(1)
            .with_initial_delay(Duration::from_millis(10));

        assert!(connect_with_retry(&config, Some(retry)).await.is_err());
    }
}
