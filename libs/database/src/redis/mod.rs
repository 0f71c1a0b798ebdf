//! Redis connector for the bad-token set.

mod config;
mod connector;

pub use config::RedisConfig;
pub use connector::{connect, connect_with_retry};

// Re-export redis types for convenience
pub use redis::aio::ConnectionManager;
pub use redis::{AsyncCommands, RedisResult};
