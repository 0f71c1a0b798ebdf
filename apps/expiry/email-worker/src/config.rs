//! Process-level settings for the email worker.

use core_config::{ConfigError, FromEnv, env_parse};
use std::time::Duration;

/// Time allowed to open each worker's SMTP session at startup.
pub const SMTP_INIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Independent consumer + SMTP session pipelines.
    pub worker_count: usize,
    /// Port for `/health` and `/metrics`.
    pub health_port: u16,
    pub smtp_init_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            health_port: 8081,
            smtp_init_window: SMTP_INIT_WINDOW,
        }
    }
}

/// - `EMAIL_WORKER_COUNT` (default: 5, at least 1)
/// - `EMAIL_WORKER_HEALTH_PORT` (default: 8081)
impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let worker_count: usize = env_parse("EMAIL_WORKER_COUNT", defaults.worker_count)?;
        if worker_count == 0 {
            return Err(ConfigError::ParseError {
                key: "EMAIL_WORKER_COUNT".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            worker_count,
            health_port: env_parse("EMAIL_WORKER_HEALTH_PORT", defaults.health_port)?,
            smtp_init_window: defaults.smtp_init_window,
        })
    }
}
