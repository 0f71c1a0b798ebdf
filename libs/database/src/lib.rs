//! Connectors for the stores behind push delivery: PostgreSQL (devices) and
//! Redis (bad-token set).
//!
//! # Features
//!
//! - `postgres` (default) - PostgreSQL support with SeaORM
//! - `redis` (default) - Redis support
//! - `config` (default) - Configuration support with `core_config::FromEnv`
//!
//! # Examples
//!
//! ```ignore
//! use core_config::FromEnv;
//! use database::{postgres, redis};
//!
//! let db = postgres::connect_with_retry(&postgres::PostgresConfig::from_env()?, None).await?;
//! let conn = redis::connect_with_retry(&redis::RedisConfig::from_env()?, None).await?;
//! ```

pub mod common;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

pub use common::{DatabaseError, DatabaseResult, RetryConfig};
