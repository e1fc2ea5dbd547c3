//! Configuration management for changerelay components

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for changerelay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// In-process router configuration
    pub router: RouterConfig,

    /// One entry per downstream projection consumer
    pub consumers: Vec<ConsumerConfig>,

    /// Batch wire-format limits
    pub batch: BatchConfig,

    /// Backoff used by consumer workers after broker receive errors
    pub retry_backoff: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json or pretty)
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,

    /// Prometheus metrics bind address
    pub bind_address: String,
}

/// What the router does with a handler failure after logging it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationMode {
    /// Log only
    Log,
    /// Keep the failure in a bounded in-memory dead-letter buffer
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub escalation: EscalationMode,

    /// Capacity of the dead-letter buffer when `escalation = "dead_letter"`
    pub dead_letter_capacity: usize,
}

/// Kind of derived store a consumer projects into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    SearchIndex,
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer name used in logs and metrics
    pub name: String,

    /// Queue the consumer is bound to
    pub queue: String,

    pub projection: ProjectionKind,

    /// Number of listener slots (workers) processing deliveries concurrently
    pub concurrency: usize,

    /// Record field used as the document/cache key
    pub key_field: String,

    /// Requeue on apply failure; when false failed deliveries are rejected without redelivery
    pub requeue_on_failure: bool,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>, queue: impl Into<String>, projection: ProjectionKind) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            projection,
            concurrency: 1,
            key_field: "id".to_string(),
            requeue_on_failure: true,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of items a producer may put in one batch message
    pub max_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Maximum jitter in milliseconds
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            observability: ObservabilityConfig {
                logging: LoggingConfig {
                    level: "info".to_string(),
                    format: "json".to_string(),
                },
                metrics: MetricsConfig {
                    enabled: false,
                    bind_address: "0.0.0.0:9090".to_string(),
                },
            },
            router: RouterConfig {
                escalation: EscalationMode::Log,
                dead_letter_capacity: 1024,
            },
            consumers: vec![
                ConsumerConfig::new("search-index", "changes.search", ProjectionKind::SearchIndex),
                ConsumerConfig::new("cache", "changes.cache", ProjectionKind::Cache),
            ],
            batch: BatchConfig { max_items: 1000 },
            retry_backoff: RetryConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("changerelay.toml")
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&RelayConfig::default())?);

        if path.as_ref().exists() {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        builder
            .add_source(Environment::with_prefix("CHANGERELAY").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Load configuration from environment variables only
    pub fn load_from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&RelayConfig::default())?)
            .add_source(Environment::with_prefix("CHANGERELAY").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn consumer(&self, name: &str) -> Option<&ConsumerConfig> {
        self.consumers.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.batch.max_items, 1000);
        assert_eq!(config.consumers.len(), 2);
        assert_eq!(config.router.escalation, EscalationMode::Log);

        let search = config.consumer("search-index").unwrap();
        assert_eq!(search.concurrency, 1);
        assert_eq!(search.projection, ProjectionKind::SearchIndex);
        assert!(search.requeue_on_failure);
    }

    #[test]
    fn test_config_serialization() {
        let config = RelayConfig::default();
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: RelayConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(config.batch.max_items, deserialized.batch.max_items);
        assert_eq!(config.consumers[1].queue, deserialized.consumers[1].queue);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("changerelay-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[router]
escalation = "dead_letter"
dead_letter_capacity = 8

[batch]
max_items = 250
"#,
        )
        .unwrap();

        let config = RelayConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.router.escalation, EscalationMode::DeadLetter);
        assert_eq!(config.router.dead_letter_capacity, 8);
        assert_eq!(config.batch.max_items, 250);
        assert_eq!(config.observability.logging.level, "info");
    }

    #[test]
    fn test_concurrency_is_at_least_one() {
        let consumer = ConsumerConfig::new("c", "q", ProjectionKind::Cache).with_concurrency(0);
        assert_eq!(consumer.concurrency, 1);
    }
}
