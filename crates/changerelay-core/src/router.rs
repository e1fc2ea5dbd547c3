//! Fan-out of change events to registered handlers with per-handler isolation

use crate::{
    ChangeEvent, ChangeHandler, DeadLetterBuffer, FailureEscalation, HandlerFailure,
    HandlerRegistry, LogOnly, OperationType, Result,
};
use changerelay_shared::{EscalationMode, RelayMetrics, RouterConfig};
use futures::FutureExt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Result of routing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No registered handler supports the collection
    NoHandler,

    /// Handlers matched but the operation type is unrecognized
    Ignored { matched: usize },

    /// Every matched handler was called; `failed` names the ones that errored
    Dispatched { delivered: usize, failed: Vec<String> },
}

/// Result of `flush_all`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct RouterCounters {
    routed: AtomicU64,
    no_handler: AtomicU64,
    ignored: AtomicU64,
    handler_failures: AtomicU64,
    flush_failures: AtomicU64,
}

/// Point-in-time copy of the router counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub no_handler: u64,
    pub ignored: u64,
    pub handler_failures: u64,
    pub flush_failures: u64,
}

/// Broadcasts each change event to every handler supporting its collection.
///
/// A failing or panicking handler is logged, counted and escalated; it never
/// stops the remaining handlers from seeing the event. Nothing is retried here.
pub struct EventRouter {
    registry: Arc<HandlerRegistry>,
    escalation: Arc<dyn FailureEscalation>,
    dead_letters: Option<Arc<DeadLetterBuffer>>,
    counters: RouterCounters,
}

impl EventRouter {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            escalation: Arc::new(LogOnly),
            dead_letters: None,
            counters: RouterCounters::default(),
        }
    }

    pub fn from_config(registry: Arc<HandlerRegistry>, config: &RouterConfig) -> Self {
        let router = Self::new(registry);
        match config.escalation {
            EscalationMode::Log => router,
            EscalationMode::DeadLetter => {
                router.with_dead_letters(Arc::new(DeadLetterBuffer::new(config.dead_letter_capacity)))
            }
        }
    }

    /// Escalate failures to a custom sink
    pub fn with_escalation(mut self, escalation: Arc<dyn FailureEscalation>) -> Self {
        self.escalation = escalation;
        self.dead_letters = None;
        self
    }

    /// Escalate failures into a dead-letter buffer readable through [`Self::dead_letters`]
    pub fn with_dead_letters(mut self, buffer: Arc<DeadLetterBuffer>) -> Self {
        self.escalation = buffer.clone();
        self.dead_letters = Some(buffer);
        self
    }

    /// The dead-letter buffer failures go to, when one is configured
    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterBuffer>> {
        self.dead_letters.as_ref()
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Route an event using its own collection name
    pub async fn dispatch(&self, event: &ChangeEvent) -> RouteOutcome {
        self.route(&event.collection, event).await
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, operation = %event.operation))]
    pub async fn route(&self, collection: &str, event: &ChangeEvent) -> RouteOutcome {
        let operation = event.operation;
        let snapshot = self.registry.all();

        // A panicking `supports` counts as a matched handler that failed.
        let mut handlers = Vec::new();
        let mut failed = Vec::new();
        for handler in snapshot.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.supports(collection))) {
                Ok(true) => handlers.push(handler.clone()),
                Ok(false) => {}
                Err(payload) => {
                    let reason = format!("supports panicked: {}", panic_message(payload.as_ref()));
                    self.record_failure(handler.as_ref(), collection, event, reason);
                    failed.push(handler.name().to_string());
                }
            }
        }

        let matched = handlers.len() + failed.len();
        if matched == 0 {
            warn!(collection = %collection, "No handler registered for collection");
            self.counters.no_handler.fetch_add(1, Ordering::Relaxed);
            RelayMetrics::no_handler(collection);
            return RouteOutcome::NoHandler;
        }

        if !operation.is_recognized() {
            debug!(collection = %collection, matched, "Ignoring unrecognized operation type");
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return RouteOutcome::Ignored { matched };
        }

        for handler in &handlers {
            let outcome = AssertUnwindSafe(invoke(handler.as_ref(), operation, collection, event))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("handler panicked: {}", panic_message(payload.as_ref()))),
            };

            if let Some(reason) = failure {
                self.record_failure(handler.as_ref(), collection, event, reason);
                failed.push(handler.name().to_string());
            }
        }

        self.counters.routed.fetch_add(1, Ordering::Relaxed);
        RelayMetrics::event_routed(collection, operation.as_str());

        RouteOutcome::Dispatched {
            delivered: matched,
            failed,
        }
    }

    fn record_failure(&self, handler: &dyn ChangeHandler, collection: &str, event: &ChangeEvent, reason: String) {
        error!(
            handler = %handler.name(),
            operation = %event.operation,
            collection = %collection,
            error = %reason,
            "Change handler failed"
        );
        self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
        RelayMetrics::handler_failed(handler.name(), event.operation.as_str());
        self.escalation.escalate(HandlerFailure::dispatch(
            handler.name(),
            collection,
            event.operation,
            event.id.as_str(),
            reason,
        ));
    }

    /// Flush every registered handler, isolating failures
    #[instrument(skip(self))]
    pub async fn flush_all(&self) -> FlushReport {
        let handlers = self.registry.all();
        let mut report = FlushReport::default();

        for handler in handlers.iter() {
            let outcome = AssertUnwindSafe(handler.flush()).catch_unwind().await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("handler panicked: {}", panic_message(payload.as_ref()))),
            };

            match failure {
                None => report.flushed += 1,
                Some(reason) => {
                    error!(handler = %handler.name(), error = %reason, "Change handler flush failed");
                    self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                    RelayMetrics::flush_failed(handler.name());
                    self.escalation.escalate(HandlerFailure::flush(handler.name(), reason));
                    report.failed.push(handler.name().to_string());
                }
            }
        }

        debug!(flushed = report.flushed, failed = report.failed.len(), "Flushed change handlers");
        report
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            no_handler: self.counters.no_handler.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
        }
    }
}

async fn invoke(
    handler: &dyn ChangeHandler,
    operation: OperationType,
    collection: &str,
    event: &ChangeEvent,
) -> Result<()> {
    match operation {
        OperationType::Insert => handler.handle_insert(collection, event).await,
        OperationType::Update => handler.handle_update(collection, event).await,
        OperationType::Delete => handler.handle_delete(collection, event).await,
        OperationType::Replace => handler.handle_replace(collection, event).await,
        OperationType::Unrecognized => Ok(()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
