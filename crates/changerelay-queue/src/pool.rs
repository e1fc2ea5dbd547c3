//! Worker pool pulling deliveries from a source, one at a time per slot

use crate::{DeliveryHandler, DeliverySource, Settlement};
use changerelay_shared::{
    ActivityHealthCheck, ConsumerConfig, ExponentialBackoff, RetryConfig, RetryExecutor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Per-run totals of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub processed: u64,
    pub acked: u64,
    pub requeued: u64,
    pub settle_failures: u64,
    /// Workers that stopped because the source kept failing
    pub failed_workers: usize,
}

impl PoolReport {
    fn record(&mut self, settlement: &Settlement) {
        self.processed += 1;
        match settlement {
            Settlement::Acked => self.acked += 1,
            Settlement::Requeued { .. } => self.requeued += 1,
            Settlement::SettleFailed { .. } => self.settle_failures += 1,
        }
    }

    fn merge(&mut self, other: PoolReport) {
        self.processed += other.processed;
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.settle_failures += other.settle_failures;
        self.failed_workers += other.failed_workers;
    }
}

/// Requests a pool to stop between deliveries
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Runs `concurrency` listener slots over one delivery source.
///
/// Each slot handles one delivery at a time; there is no ordering between
/// slots. Receive errors are retried with backoff. A delivery in progress is
/// never cancelled: shutdown is observed only while waiting for the next one.
pub struct ConsumerPool {
    name: String,
    source: Arc<dyn DeliverySource>,
    handler: Arc<dyn DeliveryHandler>,
    concurrency: usize,
    backoff: RetryConfig,
    max_receive_attempts: Option<u32>,
    health: Arc<ActivityHealthCheck>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConsumerPool {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DeliverySource>,
        handler: Arc<dyn DeliveryHandler>,
        concurrency: usize,
    ) -> Self {
        let name = name.into();
        let (shutdown, _) = watch::channel(false);
        Self {
            health: Arc::new(ActivityHealthCheck::new(name.clone(), Duration::from_secs(300))),
            name,
            source,
            handler,
            concurrency: concurrency.max(1),
            backoff: RetryConfig::default(),
            max_receive_attempts: None,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn from_config(
        config: &ConsumerConfig,
        backoff: RetryConfig,
        source: Arc<dyn DeliverySource>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        Self::new(config.name.clone(), source, handler, config.concurrency).with_backoff(backoff)
    }

    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Give up a slot after this many consecutive receive failures
    pub fn with_max_receive_attempts(mut self, attempts: u32) -> Self {
        self.max_receive_attempts = Some(attempts.max(1));
        self
    }

    /// A delivery still being handled after `timeout` marks the pool unhealthy
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.health = Arc::new(ActivityHealthCheck::new(self.name.clone(), timeout));
        self
    }

    pub fn health_check(&self) -> Arc<ActivityHealthCheck> {
        self.health.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run until the source is exhausted or shutdown is requested
    #[instrument(skip(self), fields(pool = %self.name))]
    pub async fn run(self) -> PoolReport {
        info!(concurrency = self.concurrency, "Starting consumer pool");

        let mut workers = Vec::with_capacity(self.concurrency);
        for slot in 0..self.concurrency {
            let worker = Worker {
                slot,
                source: self.source.clone(),
                handler: self.handler.clone(),
                executor: RetryExecutor::new(match self.max_receive_attempts {
                    Some(attempts) => ExponentialBackoff::new(self.backoff.clone(), attempts),
                    None => ExponentialBackoff::unbounded(self.backoff.clone()),
                }),
                health: self.health.clone(),
                shutdown: self.shutdown.subscribe(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        let mut report = PoolReport::default();
        for handle in workers {
            match handle.await {
                Ok(worker_report) => report.merge(worker_report),
                Err(e) => {
                    error!("Consumer worker task failed: {}", e);
                    report.failed_workers += 1;
                }
            }
        }

        info!(
            processed = report.processed,
            acked = report.acked,
            requeued = report.requeued,
            "Consumer pool stopped"
        );
        report
    }
}

struct Worker {
    slot: usize,
    source: Arc<dyn DeliverySource>,
    handler: Arc<dyn DeliveryHandler>,
    executor: RetryExecutor<ExponentialBackoff>,
    health: Arc<ActivityHealthCheck>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) -> PoolReport {
        let mut report = PoolReport::default();

        loop {
            if *self.shutdown.borrow() {
                info!(slot = self.slot, "Shutdown requested, worker stopping");
                break;
            }

            let source = self.source.clone();
            let next = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = self.executor.execute(move || {
                    let source = source.clone();
                    Box::pin(async move { source.next_delivery().await })
                }) => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let settlement = {
                        let _busy = self.health.begin();
                        self.handler.handle(&delivery).await
                    };
                    report.record(&settlement);
                }
                Ok(None) => {
                    info!(slot = self.slot, "Delivery source closed, worker stopping");
                    break;
                }
                Err(e) => {
                    warn!(slot = self.slot, consumer = %self.handler.name(), error = %e, "Giving up on delivery source");
                    report.failed_workers += 1;
                    break;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Delivery, InMemoryBroker, SourceError};
    use changerelay_shared::{HealthCheck, HealthStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        tags: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl DeliveryHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, delivery: &Delivery) -> Settlement {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.tags.lock().push(delivery.tag);
            Settlement::Acked
        }
    }

    #[tokio::test]
    async fn test_pool_drains_channel_source() {
        let (tx, source) = crate::ChannelSource::channel(32);
        let handler = Arc::new(CountingHandler::default());
        let pool = ConsumerPool::new("cache", Arc::new(source), handler.clone(), 3);

        for tag in 1..=10 {
            tx.send(Delivery::new(tag, &b"{}"[..])).await.unwrap();
        }
        drop(tx);

        let report = pool.run().await;

        assert_eq!(report.processed, 10);
        assert_eq!(report.acked, 10);
        let mut tags = handler.tags.lock().clone();
        tags.sort_unstable();
        assert_eq!(tags, (1..=10u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_idle_pool_stays_healthy() {
        let broker = Arc::new(InMemoryBroker::default());
        let pool = ConsumerPool::new("idle", broker, Arc::new(CountingHandler::default()), 1)
            .with_stall_timeout(Duration::from_millis(50));
        let health = pool.health_check();
        let shutdown = pool.shutdown_handle();

        let running = tokio::spawn(pool.run());
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(health.check(), HealthStatus::Healthy);

        shutdown.shutdown();
        running.await.unwrap();
    }

    struct StuckHandler;

    #[async_trait]
    impl DeliveryHandler for StuckHandler {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn handle(&self, _delivery: &Delivery) -> Settlement {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Settlement::Acked
        }
    }

    #[tokio::test]
    async fn test_stalled_delivery_is_unhealthy() {
        let (tx, source) = crate::ChannelSource::channel(1);
        tx.send(Delivery::new(1, &b"{}"[..])).await.unwrap();
        drop(tx);

        let pool = ConsumerPool::new("stuck", Arc::new(source), Arc::new(StuckHandler), 1)
            .with_stall_timeout(Duration::from_millis(50));
        let health = pool.health_check();

        let running = tokio::spawn(pool.run());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(health.check(), HealthStatus::Unhealthy { .. }));

        let report = running.await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(health.check(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let broker = Arc::new(InMemoryBroker::default());
        let pool = ConsumerPool::new("idle", broker, Arc::new(CountingHandler::default()), 2);
        let shutdown = pool.shutdown_handle();

        let running = tokio::spawn(pool.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.shutdown();

        let report = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("pool did not stop")
            .unwrap();
        assert_eq!(report.processed, 0);
    }

    struct FlakySource {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl DeliverySource for FlakySource {
        async fn next_delivery(&self) -> Result<Option<Delivery>, SourceError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SourceError::Receive("connection refused".to_string()));
            }
            Ok(None)
        }
    }

    fn fast_backoff() -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_receive_errors_are_retried() {
        let source = Arc::new(FlakySource {
            failures_left: AtomicU32::new(3),
        });
        let pool = ConsumerPool::new("flaky", source.clone(), Arc::new(CountingHandler::default()), 1)
            .with_backoff(fast_backoff());

        let report = pool.run().await;

        assert_eq!(report.failed_workers, 0);
        assert_eq!(source.failures_left.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_gives_up_after_max_attempts() {
        let source = Arc::new(FlakySource {
            failures_left: AtomicU32::new(100),
        });
        let pool = ConsumerPool::new("broken", source, Arc::new(CountingHandler::default()), 2)
            .with_backoff(fast_backoff())
            .with_max_receive_attempts(2);

        let report = pool.run().await;
        assert_eq!(report.failed_workers, 2);
    }
}
