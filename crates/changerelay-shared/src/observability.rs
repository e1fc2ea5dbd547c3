//! Observability features including logging, metrics, and health aggregation

use metrics::{counter, histogram, Label};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::{LoggingConfig, MetricsConfig, ObservabilityConfig};

/// Global observability system
static OBSERVABILITY: OnceCell<ObservabilitySystem> = OnceCell::new();

/// Observability system for centralized logging and metrics
pub struct ObservabilitySystem {
    metrics_enabled: bool,
}

impl ObservabilitySystem {
    /// Initialize the observability system
    pub fn init(config: &ObservabilityConfig) -> anyhow::Result<()> {
        let system = Self {
            metrics_enabled: config.metrics.enabled,
        };

        Self::init_logging(&config.logging)?;

        if config.metrics.enabled {
            Self::init_metrics(&config.metrics)?;
        }

        OBSERVABILITY.set(system).map_err(|_| {
            anyhow::anyhow!("Observability system already initialized")
        })?;

        info!("Observability system initialized");
        Ok(())
    }

    /// Initialize structured logging
    fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
        let level = match config.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };

        let env_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let registry = tracing_subscriber::registry().with(env_filter);

        match config.format.to_lowercase().as_str() {
            "json" => {
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE);
                registry.with(json_layer).try_init()?;
            }
            _ => {
                let pretty_layer = tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_span_events(FmtSpan::CLOSE);
                registry.with(pretty_layer).try_init()?;
            }
        }

        Ok(())
    }

    /// Install the Prometheus recorder and its scrape listener
    fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
        let bind_addr: SocketAddr = config.bind_address.parse()?;

        PrometheusBuilder::new()
            .with_http_listener(bind_addr)
            .install()?;

        info!("Prometheus metrics initialized on {}", bind_addr);
        Ok(())
    }

    /// Get the global observability system
    pub fn get() -> Option<&'static ObservabilitySystem> {
        OBSERVABILITY.get()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }
}

/// Router and consumer metrics
pub struct RelayMetrics;

impl RelayMetrics {
    /// A change event was dispatched to at least one handler
    pub fn event_routed(collection: &str, operation: &str) {
        counter!("changerelay_events_routed_total",
                "collection" => collection.to_string(),
                "operation" => operation.to_string())
            .increment(1);
    }

    /// No registered handler supports the collection
    pub fn no_handler(collection: &str) {
        counter!("changerelay_events_unhandled_total", "collection" => collection.to_string())
            .increment(1);
    }

    /// A handler callback returned an error or panicked
    pub fn handler_failed(handler: &str, operation: &str) {
        counter!("changerelay_handler_failures_total",
                "handler" => handler.to_string(),
                "operation" => operation.to_string())
            .increment(1);
    }

    pub fn flush_failed(handler: &str) {
        counter!("changerelay_flush_failures_total", "handler" => handler.to_string())
            .increment(1);
    }

    /// A delivery reached its terminal ack/requeue decision
    pub fn delivery_settled(consumer: &str, decision: &str) {
        counter!("changerelay_deliveries_total",
                "consumer" => consumer.to_string(),
                "decision" => decision.to_string())
            .increment(1);
    }

    /// The ack/requeue call itself failed
    pub fn settle_failed(consumer: &str) {
        counter!("changerelay_settle_failures_total", "consumer" => consumer.to_string())
            .increment(1);
    }

    /// A batch arrived above the configured item limit
    pub fn oversized_batch(consumer: &str) {
        counter!("changerelay_oversized_batches_total", "consumer" => consumer.to_string())
            .increment(1);
    }

    pub fn batch_items(consumer: &str, items: usize) {
        histogram!("changerelay_batch_items", "consumer" => consumer.to_string())
            .record(items as f64);
    }
}

/// Performance timer helper, records on drop
pub struct PerfTimer {
    start: Instant,
    metric_name: String,
    labels: Vec<(String, String)>,
}

impl PerfTimer {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            metric_name: metric_name.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let labels: Vec<Label> = self
                .labels
                .iter()
                .map(|(k, v)| Label::new(k.clone(), v.clone()))
                .collect();
            histogram!(self.metric_name.clone(), labels).record(self.start.elapsed().as_secs_f64());
        }
    }
}

/// Health check status
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

/// Component health check trait
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self) -> HealthStatus;
}

/// System health aggregator
pub struct HealthAggregator {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    pub fn add_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn check_all(&self) -> Vec<(String, HealthStatus)> {
        self.checks
            .iter()
            .map(|check| (check.name().to_string(), check.check()))
            .collect()
    }

    pub fn overall_status(&self) -> HealthStatus {
        let results = self.check_all();

        let unhealthy: Vec<_> = results
            .iter()
            .filter_map(|(name, status)| match status {
                HealthStatus::Unhealthy { reason } => Some(format!("{}: {}", name, reason)),
                _ => None,
            })
            .collect();

        if !unhealthy.is_empty() {
            return HealthStatus::Unhealthy {
                reason: unhealthy.join(", "),
            };
        }

        let degraded: Vec<_> = results
            .iter()
            .filter_map(|(name, status)| match status {
                HealthStatus::Degraded { reason } => Some(format!("{}: {}", name, reason)),
                _ => None,
            })
            .collect();

        if !degraded.is_empty() {
            return HealthStatus::Degraded {
                reason: degraded.join(", "),
            };
        }

        HealthStatus::Healthy
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}
