use core_config::{ConfigError, FromEnv, env_or_default};
use std::path::PathBuf;

pub const DEFAULT_METRICS_FILE: &str = "./metrics/sender.prom";

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Textfile-collector output written when the run ends.
    pub metrics_file: PathBuf,
}

/// - `PUSH_METRICS_FILE` (default: `./metrics/sender.prom`)
impl FromEnv for SenderConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            metrics_file: PathBuf::from(env_or_default("PUSH_METRICS_FILE", DEFAULT_METRICS_FILE)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_metrics_file() {
        temp_env::with_var_unset("PUSH_METRICS_FILE", || {
            let config = SenderConfig::from_env().unwrap();
            assert_eq!(config.metrics_file, PathBuf::from(DEFAULT_METRICS_FILE));
        });
    }

    #[test]
    fn test_custom_metrics_file() {
        temp_env::with_var("PUSH_METRICS_FILE", Some("/var/lib/node_exporter/sender.prom"), || {
            let config = SenderConfig::from_env().unwrap();
            assert_eq!(config.metrics_file, PathBuf::from("/var/lib/node_exporter/sender.prom"));
        });
    }
}
