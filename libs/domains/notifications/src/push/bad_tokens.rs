//! Quarantine set for device tokens APNs reported as permanently invalid.

use crate::error::NotificationResult;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

/// Redis set holding tokens waiting for removal from `ios_devices`.
pub const BAD_TOKEN_KEY: &str = "apns_bad_token";

/// Tokens taken from the set per cleanup batch.
pub const CLEANUP_BATCH_SIZE: usize = 100;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BadTokenStore: Send + Sync {
    /// Add a token to the set. Saving the same token twice is a no-op.
    async fn save(&self, token: &str) -> NotificationResult<()>;

    /// Atomically remove and return up to `count` tokens. Empty when the set is.
    async fn pop_batch(&self, count: usize) -> NotificationResult<Vec<String>>;
}

#[derive(Clone)]
pub struct RedisBadTokenStore {
    redis: ConnectionManager,
    key: String,
}

impl RedisBadTokenStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_key(redis, BAD_TOKEN_KEY)
    }

    pub fn with_key(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl BadTokenStore for RedisBadTokenStore {
    async fn save(&self, token: &str) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let added: i64 = conn.sadd(&self.key, token).await?;
        debug!(key = %self.key, added, "Bad token saved");
        Ok(())
    }

    async fn pop_batch(&self, count: usize) -> NotificationResult<Vec<String>> {
        let mut conn = self.redis.clone();
        // SPOP with a count replies nil for a missing key on older servers
        let tokens: Option<Vec<String>> = redis::cmd("SPOP")
            .arg(&self.key)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(tokens.unwrap_or_default())
    }
}
