//! Worker configuration loaded from the environment.

use core_config::{ConfigError, FromEnv, env_parse};
use message_pipeline::QueueSetting;

/// Subscription and task name used for metrics, logs and scoped settings
pub const SUBSCRIPTION: &str = "order-events";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub health_port: u16,
    /// Records processed concurrently by the pipeline
    pub concurrency: usize,
    /// Pause between two simulated broker deliveries
    pub publish_interval_ms: u64,
    pub queue: QueueSetting,
}

impl WorkerConfig {
    pub const DEFAULT_HEALTH_PORT: u16 = 8082;
    pub const DEFAULT_CONCURRENCY: usize = 4;
    pub const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 250;
}

impl FromEnv for WorkerConfig {
    /// `QUEUE_WORKER_HEALTH_PORT` wins over `HEALTH_PORT`.
    fn from_env() -> Result<Self, ConfigError> {
        let health_port = match core_config::env_parse_optional("QUEUE_WORKER_HEALTH_PORT")? {
            Some(port) => port,
            None => env_parse("HEALTH_PORT", Self::DEFAULT_HEALTH_PORT)?,
        };
        let concurrency: usize = env_parse("QUEUE_WORKER_CONCURRENCY", Self::DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUEUE_WORKER_CONCURRENCY".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            health_port,
            concurrency,
            publish_interval_ms: env_parse(
                "QUEUE_WORKER_PUBLISH_INTERVAL_MS",
                Self::DEFAULT_PUBLISH_INTERVAL_MS,
            )?,
            queue: QueueSetting::from_env(SUBSCRIPTION)?,
        })
    }
}
