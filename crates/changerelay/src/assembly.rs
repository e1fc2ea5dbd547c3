use changerelay_core::{EventRouter, HandlerRegistry};
use changerelay_queue::{
    Acknowledger, BatchConsumer, CacheProjection, CacheStore, ConsumerPool, DeliverySource,
    Projection, SearchIndex, SearchIndexProjection,
};
use changerelay_shared::{ConsumerConfig, ObservabilitySystem, ProjectionKind, RelayConfig};
use std::sync::Arc;
use tracing::info;

/// Install logging and, when enabled, the Prometheus exporter.
pub fn init_observability(config: &RelayConfig) -> anyhow::Result<()> {
    ObservabilitySystem::init(&config.observability)
}

/// Router over `registry` with the configured failure escalation.
pub fn build_router(config: &RelayConfig, registry: Arc<HandlerRegistry>) -> EventRouter {
    EventRouter::from_config(registry, &config.router)
}

/// Derived stores projections write into.
#[derive(Clone)]
pub struct Backends {
    /// Target of `search_index` consumers
    pub search_index: Arc<dyn SearchIndex>,
    /// Target of `cache` consumers
    pub cache: Arc<dyn CacheStore>,
}

impl Backends {
    /// Projection for a consumer, chosen by its `projection` kind.
    pub fn projection_for(&self, config: &ConsumerConfig) -> Arc<dyn Projection> {
        match config.projection {
            ProjectionKind::SearchIndex => Arc::new(SearchIndexProjection::new(
                config.name.clone(),
                self.search_index.clone(),
                config.key_field.clone(),
            )),
            ProjectionKind::Cache => Arc::new(CacheProjection::new(
                config.name.clone(),
                self.cache.clone(),
                config.key_field.clone(),
            )),
        }
    }
}

/// Batch consumer for one configured projection, holding `batch.max_items`.
pub fn build_consumer(
    relay: &RelayConfig,
    config: &ConsumerConfig,
    acker: Arc<dyn Acknowledger>,
    backends: &Backends,
) -> BatchConsumer<Arc<dyn Projection>> {
    BatchConsumer::from_config(config, backends.projection_for(config), acker)
        .with_max_items(relay.batch.max_items)
}

/// Wire one configured consumer to its queue.
///
/// `queue` both feeds deliveries and settles them, as a broker channel does.
pub fn build_consumer_pool<Q>(
    relay: &RelayConfig,
    config: &ConsumerConfig,
    queue: Arc<Q>,
    backends: &Backends,
) -> ConsumerPool
where
    Q: DeliverySource + Acknowledger + 'static,
{
    let consumer = build_consumer(relay, config, queue.clone(), backends);

    info!(
        consumer = %config.name,
        queue = %config.queue,
        concurrency = config.concurrency,
        "Consumer assembled"
    );
    ConsumerPool::from_config(config, relay.retry_backoff.clone(), queue, Arc::new(consumer))
}
