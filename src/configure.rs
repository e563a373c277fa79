use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::transfer::retry::RetryStrategy;
use crate::transfer::worker::WorkerConfig;

pub const DEFAULT_CONFIG_FILE: &str = "config/porter.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub poll_interval_ms: u64,
    pub auth_timeout_ms: u64,
    pub cancel_check_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub lease_timeout_ms: u64,
}

impl WorkerSettings {
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval_ms: self.poll_interval_ms,
            auth_timeout_ms: self.auth_timeout_ms,
            cancel_check_ms: self.cancel_check_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            lease_timeout_ms: self.lease_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// none | uniform | exponential
    pub strategy: String,
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub multiplier: f64,
}

impl RetrySettings {
    pub fn to_strategy(&self) -> Result<RetryStrategy, ConfigError> {
        match self.strategy.to_lowercase().as_str() {
            "none" => Ok(RetryStrategy::NoRetry),
            "uniform" => Ok(RetryStrategy::Uniform {
                max_attempts: self.max_attempts,
                interval_ms: self.interval_ms,
            }),
            "exponential" => Ok(RetryStrategy::Exponential {
                max_attempts: self.max_attempts,
                initial_interval_ms: self.interval_ms,
                multiplier: self.multiplier,
            }),
            other => Err(ConfigError::Message(format!(
                "unknown retry strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    /// sled directory; the in-memory store is used when empty
    pub store_path: String,
    pub workers: usize,
    pub worker: WorkerSettings,
    pub retry: RetrySettings,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Set defaults
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/porter.log")?
        .set_default("store_path", "data/porter")?
        .set_default("workers", 1)?
        .set_default("worker.poll_interval_ms", 1000)?
        .set_default("worker.auth_timeout_ms", 300_000)?
        .set_default("worker.cancel_check_ms", 1000)?
        .set_default("worker.heartbeat_interval_ms", 10_000)?
        .set_default("worker.lease_timeout_ms", 60_000)?
        .set_default("retry.strategy", "exponential")?
        .set_default("retry.max_attempts", 5)?
        .set_default("retry.interval_ms", 200)?
        .set_default("retry.multiplier", 2.0)?
        // Add configuration from a file
        .add_source(File::with_name(path).required(false))
        // Add configuration from environment variables
        .add_source(
            Environment::with_prefix("PORTER")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    s.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config_from("config/does-not-exist").unwrap();

        assert_eq!(config.workers, 1);
        assert_eq!(config.worker.auth_timeout_ms, 300_000);
        assert_eq!(config.worker.lease_timeout_ms, 60_000);
        assert_eq!(
            config.retry.to_strategy().unwrap(),
            RetryStrategy::Exponential {
                max_attempts: 5,
                initial_interval_ms: 200,
                multiplier: 2.0,
            }
        );
    }

    #[test]
    fn test_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("porter.yaml");
        std::fs::write(
            &path,
            "log_level: debug\nworkers: 3\nworker:\n  poll_interval_ms: 50\nretry:\n  strategy: uniform\n  max_attempts: 2\n",
        )
        .unwrap();

        let config = load_config_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.workers, 3);
        assert_eq!(config.worker.poll_interval_ms, 50);
        assert_eq!(config.worker.cancel_check_ms, 1000);
        assert_eq!(
            config.retry.to_strategy().unwrap(),
            RetryStrategy::Uniform {
                max_attempts: 2,
                interval_ms: 200,
            }
        );
    }

    #[test]
    fn test_unknown_retry_strategy() {
        let settings = RetrySettings {
            strategy: "sometimes".to_string(),
            max_attempts: 1,
            interval_ms: 1,
            multiplier: 1.0,
        };
        assert!(settings.to_strategy().is_err());
    }
}
