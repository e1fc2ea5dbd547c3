//! Batch consumer: decode, project, then settle each delivery exactly once

use crate::{AckDecision, Acknowledger, Delivery, ProjectionError};
use async_trait::async_trait;
use changerelay_core::{BatchMessage, OperationType, MAX_BATCH_ITEMS};
use changerelay_shared::{ConsumerConfig, PerfTimer, RelayMetrics};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Applies a decoded batch to one derived store (search index, cache, ...)
///
/// Deliveries can arrive more than once and out of order across listener
/// slots, so `apply` must be idempotent.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, batch: &BatchMessage) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<T: Projection + ?Sized> Projection for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn apply(&self, batch: &BatchMessage) -> Result<(), ProjectionError> {
        (**self).apply(batch).await
    }
}

/// How a delivery ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued { redeliver: bool },

    /// The decision was made but the broker call failed; the broker will
    /// redeliver on its own once the channel recovers
    SettleFailed { decision: AckDecision, error: String },
}

/// Anything a consumer pool can hand deliveries to
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Process and settle one delivery; never fails
    async fn handle(&self, delivery: &Delivery) -> Settlement;
}

/// Queue consumer for one projection.
///
/// Empty or undecodable batches are acked so they cannot loop forever. INSERT
/// and REPLACE batches are applied; UPDATE and DELETE have no projection logic
/// yet and are acked untouched. An apply error or panic requeues the delivery.
/// Batches above `max_items` are still applied, but logged and counted as a
/// producer contract violation.
pub struct BatchConsumer<P> {
    name: String,
    projection: P,
    acker: Arc<dyn Acknowledger>,
    requeue_on_failure: bool,
    max_items: usize,
    oversized: AtomicU64,
}

impl<P: Projection> BatchConsumer<P> {
    pub fn new(name: impl Into<String>, projection: P, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            name: name.into(),
            projection,
            acker,
            requeue_on_failure: true,
            max_items: MAX_BATCH_ITEMS,
            oversized: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ConsumerConfig, projection: P, acker: Arc<dyn Acknowledger>) -> Self {
        Self::new(config.name.clone(), projection, acker).with_requeue_on_failure(config.requeue_on_failure)
    }

    /// When false, failed deliveries are rejected without redelivery
    pub fn with_requeue_on_failure(mut self, requeue: bool) -> Self {
        self.requeue_on_failure = requeue;
        self
    }

    /// Item limit producers are expected to honour, usually `batch.max_items`
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Batches seen with more than `max_items` items
    pub fn oversized_batches(&self) -> u64 {
        self.oversized.load(Ordering::Relaxed)
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    async fn process(&self, delivery: &Delivery) -> Result<(), ProjectionError> {
        let batch: BatchMessage = match BatchMessage::decode(&delivery.payload) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "Undecodable batch, acknowledging as empty");
                return Ok(());
            }
        };

        if batch.is_empty() {
            debug!(tag = delivery.tag, collection = %batch.collection_name, "Empty batch, nothing to apply");
            return Ok(());
        }

        RelayMetrics::batch_items(&self.name, batch.len());
        if let Err(e) = batch.validate(self.max_items) {
            warn!(tag = delivery.tag, collection = %batch.collection_name, error = %e, "Batch violates producer limits");
            self.oversized.fetch_add(1, Ordering::Relaxed);
            RelayMetrics::oversized_batch(&self.name);
        }

        match batch.operation_type {
            OperationType::Insert | OperationType::Replace => {
                let _timer = PerfTimer::new("changerelay_apply_duration_seconds")
                    .with_label("consumer", self.name.clone());

                AssertUnwindSafe(self.projection.apply(&batch))
                    .catch_unwind()
                    .await
                    .map_err(|panic| ProjectionError::Panicked(panic_message(panic.as_ref())))??;

                info!(
                    collection = %batch.collection_name,
                    operation = %batch.operation_type,
                    items = batch.len(),
                    "Batch applied"
                );
                Ok(())
            }
            OperationType::Update | OperationType::Delete => {
                debug!(
                    operation = %batch.operation_type,
                    collection = %batch.collection_name,
                    items = batch.len(),
                    "No projection logic for operation, acknowledging"
                );
                Ok(())
            }
            OperationType::Unrecognized => {
                warn!(collection = %batch.collection_name, "Unrecognized operation type, acknowledging");
                Ok(())
            }
        }
    }

    async fn settle(&self, tag: u64, decision: AckDecision) -> Settlement {
        let call = async {
            match decision {
                AckDecision::Ack => self.acker.ack(tag).await,
                AckDecision::Requeue { redeliver } => self.acker.requeue(tag, redeliver).await,
            }
        };

        let error = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        match error {
            None => {
                RelayMetrics::delivery_settled(&self.name, decision.as_str());
                match decision {
                    AckDecision::Ack => Settlement::Acked,
                    AckDecision::Requeue { redeliver } => Settlement::Requeued { redeliver },
                }
            }
            Some(error) => {
                error!(tag, decision = %decision, error = %error, "Failed to settle delivery");
                RelayMetrics::settle_failed(&self.name);
                Settlement::SettleFailed { decision, error }
            }
        }
    }
}

#[async_trait]
impl<P: Projection> DeliveryHandler for BatchConsumer<P> {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, delivery), fields(consumer = %self.name, tag = delivery.tag, attempt = delivery.attempt))]
    async fn handle(&self, delivery: &Delivery) -> Settlement {
        let decision = match self.process(delivery).await {
            Ok(()) => AckDecision::Ack,
            Err(e) => {
                error!(projection = %self.projection.name(), error = %e, "Failed to apply batch");
                AckDecision::Requeue {
                    redeliver: self.requeue_on_failure,
                }
            }
        };

        self.settle(delivery.tag, decision).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
